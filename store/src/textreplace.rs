//! Streaming same-length byte replacement.
//!
//! Build outputs are normalized before hashing by swapping machine specific
//! paths for fixed values. Replacements always have the same length as the
//! bytes they replace, so offsets recorded inside an archive stay valid.
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bstr::ByteSlice;
use pin_project::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

use crate::Error;

struct ReplacementsInner {
    from: Vec<Vec<u8>>,
    to: Vec<Vec<u8>>,
    longest: usize,
}

/// A set of byte patterns and the same-length values that replace them.
#[derive(Clone)]
pub struct Replacements {
    inner: Arc<ReplacementsInner>,
}

impl Replacements {
    pub fn new<I, F, T>(pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (F, T)>,
        F: Into<Vec<u8>>,
        T: Into<Vec<u8>>,
    {
        let mut from = Vec::new();
        let mut to = Vec::new();
        for (f, t) in pairs {
            let (f, t) = (f.into(), t.into());
            if f.len() != t.len() {
                return Err(Error::ReplacementLength(f.to_str_lossy().into_owned()));
            }
            if f.is_empty() {
                continue;
            }
            from.push(f);
            to.push(t);
        }
        let longest = from.iter().map(Vec::len).max().unwrap_or(0);
        Ok(Self {
            inner: Arc::new(ReplacementsInner { from, to, longest }),
        })
    }

    /// Replaces `old_prefix` with `new_prefix` in every occurrence of one of
    /// `values`. Values not starting with `old_prefix` are ignored.
    pub fn prefix<S: AsRef<str>>(
        values: &[S],
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<Self, Error> {
        if old_prefix.len() != new_prefix.len() {
            return Err(Error::ReplacementLength(old_prefix.to_string()));
        }
        Self::new(values.iter().filter_map(|v| {
            let v = v.as_ref();
            v.strip_prefix(old_prefix)
                .map(|rest| (v.to_string(), format!("{new_prefix}{rest}")))
        }))
    }

    pub fn patterns(&self) -> &[Vec<u8>] {
        &self.inner.from
    }

    pub fn longest(&self) -> usize {
        self.inner.longest
    }

    pub fn is_empty(&self) -> bool {
        self.inner.from.is_empty()
    }

    /// Replaces all matches starting before `limit` in `buf`, marking which
    /// patterns matched. Matches don't overlap; where two patterns start at
    /// the same position the one given first wins.
    ///
    /// Returns the offset up to which `buf` will not change any more.
    fn apply(&self, buf: &mut [u8], limit: usize, matches: &mut [bool]) -> usize {
        let mut pos = 0;
        let mut ready = limit;
        loop {
            let mut best: Option<(usize, usize)> = None;
            for (idx, pattern) in self.inner.from.iter().enumerate() {
                let end = (limit + pattern.len() - 1).min(buf.len());
                if pos >= end {
                    continue;
                }
                if let Some(offset) = buf[pos..end].find(pattern) {
                    let start = pos + offset;
                    if best.map_or(true, |(s, _)| start < s) {
                        best = Some((start, idx));
                    }
                }
            }
            let Some((start, idx)) = best else {
                break;
            };
            let replacement = &self.inner.to[idx];
            buf[start..start + replacement.len()].copy_from_slice(replacement);
            matches[idx] = true;
            pos = start + replacement.len();
            ready = ready.max(pos);
        }
        ready
    }

    /// Replaces all matches in an in-memory buffer. Returns which patterns
    /// were found.
    pub fn replace_all(&self, buf: &mut [u8]) -> Vec<bool> {
        let mut matches = vec![false; self.inner.from.len()];
        let len = buf.len();
        self.apply(buf, len, &mut matches);
        matches
    }
}

const DEFAULT_BUF_SIZE: usize = 32 * 1024;

/// Wraps a reader and replaces patterns in everything read through it.
///
/// The reader holds back the last `longest - 1` bytes of each read until
/// more data arrives, so matches spanning two reads are still found.
#[pin_project]
pub struct ReplacingReader<R> {
    replacements: Replacements,
    matches: Vec<bool>,
    buffer: Vec<u8>,
    chunk_size: usize,
    consumed: usize,
    // bytes before this offset are final
    ready: usize,
    eof: bool,
    #[pin]
    reader: R,
}

impl<R> ReplacingReader<R> {
    pub fn new(replacements: Replacements, reader: R) -> Self {
        Self::with_capacity(DEFAULT_BUF_SIZE, replacements, reader)
    }

    pub fn with_capacity(capacity: usize, replacements: Replacements, reader: R) -> Self {
        let chunk_size = capacity.max(1);
        ReplacingReader {
            matches: vec![false; replacements.patterns().len()],
            buffer: Vec::with_capacity(chunk_size + replacements.longest()),
            chunk_size,
            consumed: 0,
            ready: 0,
            eof: false,
            replacements,
            reader,
        }
    }

    pub fn matches(&self) -> &[bool] {
        &self.matches
    }

    /// Patterns that matched at least once so far.
    pub fn matched_patterns(&self) -> impl Iterator<Item = &[u8]> {
        self.replacements
            .patterns()
            .iter()
            .zip(self.matches.iter())
            .filter_map(|(p, found)| found.then_some(p.as_slice()))
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncRead> AsyncRead for ReplacingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let internal_buf = ready!(self.as_mut().poll_fill_buf(cx))?;
        let amt = buf.remaining().min(internal_buf.len());
        buf.put_slice(&internal_buf[..amt]);
        self.consume(amt);
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncRead> AsyncBufRead for ReplacingReader<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<&[u8]>> {
        let overlap = self.replacements.longest().saturating_sub(1);
        let mut this = self.project();

        if *this.consumed < *this.ready {
            return Poll::Ready(Ok(&this.buffer[*this.consumed..*this.ready]));
        }
        if *this.eof {
            return Poll::Ready(Ok(&[]));
        }

        // Everything before `ready` was handed out, keep the tail which may
        // still hold the start of a match.
        this.buffer.drain(..*this.ready);
        *this.consumed = 0;
        *this.ready = 0;

        loop {
            let start = this.buffer.len();
            this.buffer.resize(start + *this.chunk_size, 0);
            let (poll, filled) = {
                let mut read_buf = ReadBuf::new(&mut this.buffer[start..]);
                let poll = this.reader.as_mut().poll_read(cx, &mut read_buf);
                (poll, read_buf.filled().len())
            };
            this.buffer.truncate(start + filled);
            match poll {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            if filled == 0 {
                *this.eof = true;
                break;
            }
            if this.buffer.len() > overlap {
                break;
            }
        }

        let limit = if *this.eof {
            this.buffer.len()
        } else {
            this.buffer.len() - overlap
        };
        *this.ready = this
            .replacements
            .apply(this.buffer.as_mut_slice(), limit, this.matches.as_mut_slice());
        Poll::Ready(Ok(&this.buffer[..*this.ready]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        debug_assert!(self.consumed + amt <= self.ready);
        let this = self.project();
        *this.consumed += amt;
    }
}
