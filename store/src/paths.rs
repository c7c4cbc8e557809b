//! Store path layout.
//!
//! The store lives in a directory whose absolute path is padded to a fixed
//! length. Two stores configured with the same padding length therefore have
//! store roots of identical length, which lets build outputs be normalized by
//! replacing the real root with [PREFIX_OF_RECORD] without shifting any byte
//! offsets.
use std::path::{Path, PathBuf};

use crate::hasher::HASH_LENGTH;
use crate::Error;

/// Filler used to pad the store directory name.
pub const PATH_PADDING_CHARACTERS: &str = "bramble_store_padding";

/// Total length of a padded store path, including its trailing slash.
pub const PATH_PADDING_LENGTH: usize = 50;

/// Substituted for the real store root when hashing build outputs, so the
/// same content hashes identically no matter where the store lives.
pub const PREFIX_OF_RECORD: &str = "/home/bramble/bramble/bramble_store_padding/bramb";

/// Prefix of scratch build and output directories created inside the store.
pub const BUILD_DIR_PREFIX: &str = "bramble_build_directory";

/// Computes the padded directory name that is appended to `bramble_path` to
/// form the store root.
///
/// The joined path is always exactly `padding_length - 1` bytes long; the
/// missing byte is the slash that follows the root when a store entry is
/// joined onto it.
pub fn padded_directory_name(bramble_path: &str, padding_length: usize) -> Result<String, Error> {
    // one slash before the directory, one after it
    let padding = padding_length as isize - bramble_path.len() as isize - 2;
    if padding <= 0 {
        return Err(Error::PathTooLong {
            path: bramble_path.into(),
            length: padding_length,
        });
    }
    let padding = padding as usize;

    let segment = PATH_PADDING_CHARACTERS.len() + 1;
    let repetitions = padding / segment;
    let extra = padding % segment;

    let mut name = String::with_capacity(padding + 1);
    for _ in 0..repetitions {
        name.push('/');
        name.push_str(PATH_PADDING_CHARACTERS);
    }
    if extra == 0 {
        // A slash followed by zero characters would leave the name one byte
        // short, so extend the last segment instead.
        name.push_str(&PATH_PADDING_CHARACTERS[..1]);
    } else {
        name.push('/');
        name.push_str(&PATH_PADDING_CHARACTERS[..extra]);
    }
    Ok(name)
}

/// Returns the padded store root for `bramble_path`.
pub fn compute_padded_root(bramble_path: &Path, padding_length: usize) -> Result<PathBuf, Error> {
    let base = bramble_path
        .to_str()
        .ok_or_else(|| Error::NonUtf8Path(bramble_path.to_path_buf()))?;
    let name = padded_directory_name(base, padding_length)?;
    Ok(PathBuf::from(format!("{base}{name}")))
}

/// Number of random characters in a scratch directory name, chosen so the
/// name is exactly as long as an output hash.
pub(crate) const SCRATCH_RANDOM_LENGTH: usize = HASH_LENGTH - BUILD_DIR_PREFIX.len();
