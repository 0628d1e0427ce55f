use std::path::Path;

use sha1::Digest;
use sha1::Sha1;

/// Seconds since the Unix epoch. Clock skew is not interesting here; a file
/// mutation journal only needs monotonically plausible ordering.
pub(crate) fn unix_ts() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Short hex digest used to address files in token wire forms and snapshot
/// filenames. Eight hex chars of SHA-1 over the normalized absolute path.
pub(crate) fn path_hash(path: &Path) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(8);
    for byte in &digest[..4] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Return `true` if `path` is inside a Git repository.
///
/// The check walks up the directory hierarchy looking for a `.git` folder, so
/// it does not require the `git` binary. Used only to decide whether recovery
/// hints should mention version-control commands.
pub(crate) fn is_inside_git_repo(path: &Path) -> bool {
    let mut dir = path.to_path_buf();
    loop {
        if dir.join(".git").exists() {
            return true;
        }
        if !dir.pop() {
            break;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn path_hash_is_eight_hex_chars_and_stable() {
        let p = PathBuf::from("/workspace/src/main.rs");
        let a = path_hash(&p);
        let b = path_hash(&p);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn path_hash_differs_across_paths() {
        assert_ne!(
            path_hash(&PathBuf::from("/a/b.txt")),
            path_hash(&PathBuf::from("/a/c.txt"))
        );
    }
}
