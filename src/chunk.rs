use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Owns a temp file's lifetime. `Drop` unlinks it, so "stealing" a temp file
/// out of one chunk and into another is a plain Rust move: the borrow checker
/// gives us lighttpd's `is_temp` exactly-once-unlink discipline for free,
/// instead of a flag someone has to remember to clear.
pub struct TempHandle(NamedTempFile);

impl TempHandle {
    pub fn new() -> io::Result<Self> {
        Ok(TempHandle(NamedTempFile::new()?))
    }

    pub fn path(&self) -> &Path {
        self.0.path()
    }

    pub fn as_file(&self) -> &File {
        self.0.as_file()
    }

    pub fn as_file_mut(&mut self) -> &mut File {
        self.0.as_file_mut()
    }
}

/// A file-backed chunk either owns a temp file (request body spilled to
/// disk, CGI stdout buffered to disk) or borrows a path the caller already
/// owns (a static file being served — never unlinked by us).
pub enum ChunkFile {
    Temp(TempHandle),
    Static { path: PathBuf, file: File },
}

impl ChunkFile {
    pub fn file(&self) -> &File {
        match self {
            ChunkFile::Temp(h) => h.as_file(),
            ChunkFile::Static { file, .. } => file,
        }
    }
}

pub enum Chunk {
    Mem {
        data: Vec<u8>,
        offset: usize,
    },
    File {
        backing: ChunkFile,
        offset: u64,
        length: u64,
    },
}

impl Chunk {
    pub fn from_mem(data: Vec<u8>) -> Self {
        Chunk::Mem { data, offset: 0 }
    }

    pub fn from_temp(handle: TempHandle, length: u64) -> Self {
        Chunk::File {
            backing: ChunkFile::Temp(handle),
            offset: 0,
            length,
        }
    }

    pub fn from_static_file(path: PathBuf, file: File, length: u64) -> Self {
        Chunk::File {
            backing: ChunkFile::Static { path, file },
            offset: 0,
            length,
        }
    }

    /// Bytes not yet consumed from this chunk.
    pub fn remaining(&self) -> u64 {
        match self {
            Chunk::Mem { data, offset } => (data.len() - offset) as u64,
            Chunk::File { offset, length, .. } => length - offset,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

/// Ordered queue of memory and file chunks with running in/out byte
/// counters, matching lighttpd's `chunkqueue`. A chunk at the head of the
/// queue is "pinned" while a write backend has an in-flight vectored or
/// zero-copy operation referencing it; `drop_finished_prefix` refuses to
/// drop a pinned chunk even if its `remaining()` reports zero, since the
/// backend hasn't confirmed the write landed yet.
pub struct ChunkQueue {
    chunks: VecDeque<Chunk>,
    bytes_in: u64,
    bytes_out: u64,
    head_pinned: bool,
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkQueue {
    pub fn new() -> Self {
        ChunkQueue {
            chunks: VecDeque::new(),
            bytes_in: 0,
            bytes_out: 0,
            head_pinned: false,
        }
    }

    pub fn append_mem(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.bytes_in += data.len() as u64;
        self.chunks.push_back(Chunk::from_mem(data));
    }

    pub fn append_file(&mut self, chunk: Chunk) {
        self.bytes_in += chunk.remaining();
        self.chunks.push_back(chunk);
    }

    /// Pushes a chunk back onto the front of the queue, for partially
    /// consumed reads that need to be put back (e.g. a short write leaving
    /// the rest of a chunk for the next poll turn never needs this — writes
    /// just advance `offset` in place — but a plugin that peeks a chunk and
    /// decides it isn't done with it yet does).
    pub fn prepend(&mut self, chunk: Chunk) {
        self.chunks.push_front(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_exhausted())
    }

    pub fn remaining(&self) -> u64 {
        self.chunks.iter().map(|c| c.remaining()).sum()
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn front(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Chunk> {
        self.chunks.front_mut()
    }

    pub fn pin_head(&mut self) {
        self.head_pinned = true;
    }

    pub fn unpin_head(&mut self) {
        self.head_pinned = false;
    }

    /// Records `n` bytes as written out of the head chunk, advancing its
    /// offset, then drops exhausted chunks from the front (skipping the
    /// head if it is pinned).
    pub fn advance(&mut self, mut n: u64) {
        self.bytes_out += n;
        while n > 0 {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let avail = chunk.remaining();
            let take = avail.min(n);
            match chunk {
                Chunk::Mem { offset, .. } => *offset += take as usize,
                Chunk::File { offset, .. } => *offset += take,
            }
            n -= take;
            self.drop_finished_prefix();
        }
    }

    /// Drops exhausted chunks from the head of the queue, refusing to drop
    /// a pinned head chunk (I-PIN: a chunk with an in-flight backend write
    /// must not be freed out from under it).
    pub fn drop_finished_prefix(&mut self) {
        loop {
            let Some(front) = self.chunks.front() else {
                break;
            };
            if !front.is_exhausted() {
                break;
            }
            if self.head_pinned {
                break;
            }
            self.chunks.pop_front();
        }
    }

    /// Takes ownership of the temp file backing the head chunk, if any,
    /// leaving the chunk's accounting untouched. Used when a chunk's
    /// contents need to outlive the chunk itself (e.g. handed to sendfile
    /// via a raw fd while the queue moves on).
    pub fn steal_tempfile(&mut self) -> Option<TempHandle> {
        match self.chunks.front_mut()? {
            Chunk::File {
                backing: ChunkFile::Temp(_),
                ..
            } => {
                let Some(Chunk::File { backing, .. }) = self.chunks.pop_front() else {
                    unreachable!()
                };
                match backing {
                    ChunkFile::Temp(h) => Some(h),
                    ChunkFile::Static { .. } => None,
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_chunk_advance_drops_when_exhausted() {
        let mut cq = ChunkQueue::new();
        cq.append_mem(b"hello".to_vec());
        assert_eq!(cq.remaining(), 5);
        cq.advance(5);
        assert!(cq.is_empty());
        assert_eq!(cq.bytes_out(), 5);
    }

    #[test]
    fn partial_advance_keeps_chunk_in_queue() {
        let mut cq = ChunkQueue::new();
        cq.append_mem(b"hello world".to_vec());
        cq.advance(5);
        assert_eq!(cq.remaining(), 6);
        assert!(!cq.is_empty());
    }

    #[test]
    fn pinned_head_survives_drop_finished_prefix() {
        let mut cq = ChunkQueue::new();
        cq.append_mem(b"x".to_vec());
        cq.pin_head();
        cq.advance(1);
        // exhausted but pinned: still present
        assert!(cq.front().is_some());
        cq.unpin_head();
        cq.drop_finished_prefix();
        assert!(cq.front().is_none());
    }

    #[test]
    fn multiple_chunks_advance_across_boundary() {
        let mut cq = ChunkQueue::new();
        cq.append_mem(b"abc".to_vec());
        cq.append_mem(b"def".to_vec());
        cq.advance(4);
        assert_eq!(cq.remaining(), 2);
    }
}
