use std::{ops::Range, path::{Component, Path, PathBuf}};
use crate::metainfo::MetaInfo;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {

    #[error("file path {0:?} escapes the torrent directory")]
    UnsafePath(PathBuf),

    #[error("access at offset {offset} length {len} runs past the torrent end")]
    OutOfRange { offset: u64, len: u64 },

    #[error(transparent)]
    MetaInfo(#[from] crate::metainfo::MetaInfoError),
}

// File information resolved from metainfo.
#[derive(Debug, Clone)]
pub struct FileInfo {

    // Path relative to the torrent base directory.
    pub path: PathBuf,

    // Length of the file in bytes.
    pub length: u64,

    // Offset in bytes from the start of the torrent when viewed as a single array.
    pub offset: u64,

}

impl FileInfo {
    // Byte index range within the whole torrent.
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..(self.offset + self.length)
    }
}

// One per-file access produced by mapping an absolute byte range onto the
// concatenated file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {

    pub file_idx: usize,

    // Offset within the file.
    pub offset: u64,

    pub len: u64,

}

// General information on torrent storage geometry.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Torrent name from metainfo.
    pub name: String,

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, <= piece_len.
    pub last_piece_len: usize,

    // Number of pieces in torrent.
    pub num_pieces: usize,

    // Request granularity in bytes.
    pub block_len: usize,

    // Files contained in torrent, metainfo order.
    pub files: Vec<FileInfo>,

    // Directory the files are placed under. Multi-file torrents get a
    // directory named after the torrent inside the output directory.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf, block_len: usize) -> Result<Self, StoreError> {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };

        let mut files = Vec::new();
        let mut offset = 0;
        for (path, length) in metainfo.files()? {
            files.push(FileInfo {
                path: sanitize_path(&path)?,
                length,
                offset,
            });
            offset += length;
        }

        Ok(Self {
            name: metainfo.name().to_string(),
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            block_len,
            files,
            output_dir,
        })
    }

    // Lockfile guarding the backing files against a second process.
    pub fn lock_path(&self) -> PathBuf {
        self.output_dir.join(format!(".{}.riptide-lock", self.name))
    }

    // Returns length of piece given its index.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_abs_offset(&self, piece_idx: usize) -> u64 {
        piece_idx as u64 * self.piece_len as u64
    }

    pub fn num_blocks(&self, piece_idx: usize) -> usize {
        crate::block::num_blocks(self.piece_length(piece_idx), self.block_len)
    }

    pub fn block_len(&self, piece_idx: usize, block_idx: usize) -> usize {
        crate::block::block_len(self.piece_length(piece_idx), block_idx, self.block_len)
    }

    // Maps an absolute byte range onto per-file slices with a stateless walk
    // over the file-length prefix sums. An access running past the last file
    // is out of range.
    pub fn file_slices(&self, offset: u64, len: u64) -> Result<Vec<FileSlice>, StoreError> {

        let mut slices = Vec::new();
        let mut remaining = len;
        let mut offset_left = offset;

        for (idx, file) in self.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if offset_left >= file.length {
                offset_left -= file.length;
                continue;
            }

            let space = file.length - offset_left;
            let take = space.min(remaining);
            slices.push(FileSlice {
                file_idx: idx,
                offset: offset_left,
                len: take,
            });
            offset_left = 0;
            remaining -= take;
        }

        if remaining > 0 {
            return Err(StoreError::OutOfRange { offset, len });
        }
        Ok(slices)
    }
}

// Normalizes a metainfo-declared path and refuses anything that could
// escape the torrent base directory.
fn sanitize_path(path: &Path) -> Result<PathBuf, StoreError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(StoreError::UnsafePath(path.to_path_buf())),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(StoreError::UnsafePath(path.to_path_buf()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with_files(lens: &[u64], piece_len: usize, block_len: usize) -> StoreInfo {
        let total_len: u64 = lens.iter().sum();
        let num_pieces = (total_len as usize + piece_len - 1) / piece_len;
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;

        let mut files = Vec::new();
        let mut offset = 0;
        for (i, &length) in lens.iter().enumerate() {
            files.push(FileInfo {
                path: PathBuf::from(format!("f{}", i)),
                length,
                offset,
            });
            offset += length;
        }

        StoreInfo {
            name: "test".to_string(),
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            block_len,
            files,
            output_dir: PathBuf::from("out"),
        }
    }

    #[test]
    fn test_file_slices_single_file() {
        let info = info_with_files(&[1000], 256, 128);
        let slices = info.file_slices(100, 300).unwrap();
        assert_eq!(slices, vec![FileSlice { file_idx: 0, offset: 100, len: 300 }]);
    }

    #[test]
    fn test_file_slices_span_files() {
        let info = info_with_files(&[1, 11, 1025, 23_456], 1024, 512);

        // Starts inside the second file and runs into the third.
        let slices = info.file_slices(4, 100).unwrap();
        assert_eq!(slices, vec![
            FileSlice { file_idx: 1, offset: 3, len: 8 },
            FileSlice { file_idx: 2, offset: 0, len: 92 },
        ]);

        // Covers all four files.
        let slices = info.file_slices(0, info.total_len).unwrap();
        assert_eq!(slices.len(), 4);
        assert_eq!(slices.iter().map(|s| s.len).sum::<u64>(), info.total_len);
    }

    #[test]
    fn test_file_slices_out_of_range() {
        let info = info_with_files(&[10, 10], 8, 4);
        assert!(matches!(
            info.file_slices(15, 6),
            Err(StoreError::OutOfRange { .. })
        ));
        assert!(matches!(
            info.file_slices(20, 1),
            Err(StoreError::OutOfRange { .. })
        ));
        // Exactly to the end is fine.
        assert!(info.file_slices(15, 5).is_ok());
    }

    #[test]
    fn test_piece_length_last() {
        let info = info_with_files(&[2049], 1024, 512);
        assert_eq!(info.num_pieces, 3);
        assert_eq!(info.piece_length(0), 1024);
        assert_eq!(info.piece_length(2), 1);
        assert_eq!(info.num_blocks(0), 2);
        assert_eq!(info.num_blocks(2), 1);
        assert_eq!(info.block_len(2, 0), 1);
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path(Path::new("a/b.bin")).unwrap(), PathBuf::from("a/b.bin"));
        assert_eq!(sanitize_path(Path::new("./a")).unwrap(), PathBuf::from("a"));
        assert!(matches!(sanitize_path(Path::new("../evil")), Err(StoreError::UnsafePath(_))));
        assert!(matches!(sanitize_path(Path::new("a/../../evil")), Err(StoreError::UnsafePath(_))));
        assert!(matches!(sanitize_path(Path::new("/etc/passwd")), Err(StoreError::UnsafePath(_))));
    }
}
