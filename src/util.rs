//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

use anyhow::ensure;

pub trait ReadExt {
    /// Tries to read exactly `read_len` bytes, like `read_exact`, but unlike `read_exact`, is
    /// forgiving of unexpected EOF.
    ///
    /// The returned vector will have exactly `read_len` bytes appended, unless an EOF was
    /// encountered, in which case it will have strictly shorter than `read_len` new bytes added.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        const CHUNK_SIZE: usize = 65536;

        let read_len = read_len + vec.len();
        let mut cursor = vec.len();
        while cursor < read_len {
            vec.resize(std::cmp::min(read_len, cursor + CHUNK_SIZE), 0u8);

            cursor += match self.read(&mut vec[cursor..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }

        vec.truncate(cursor);
        Ok(())
    }
}

/// Read a whole image of at most `limit` bytes, zero-padded to a multiple of `block_size`
///
/// Fails if the reader has more than `limit` bytes to give, or none at all.
pub fn read_image<R: Read>(read: &mut R, limit: usize, block_size: usize) -> anyhow::Result<Vec<u8>> {
    let mut image = Vec::new();
    // One byte past the limit tells an oversized image apart from one that fits exactly
    read.read_to_vec(&mut image, limit + 1)?;
    ensure!(!image.is_empty(), "image is empty");
    ensure!(
        image.len() <= limit,
        "image is larger than the {limit} bytes available"
    );

    let padded = image.len().div_ceil(block_size) * block_size;
    image.resize(padded, 0);
    Ok(image)
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    io::repeat(0xBB).read_to_vec(&mut vec, 2)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_read_image() -> anyhow::Result<()> {
    let image = read_image(&mut &[7u8; 700][..], 2048, 512)?;
    assert_eq!(image.len(), 1024);
    assert!(image[..700].iter().all(|&x| x == 7));
    assert!(image[700..].iter().all(|&x| x == 0));

    // Exactly at the limit is fine
    assert_eq!(read_image(&mut io::repeat(1).take(2048), 2048, 512)?.len(), 2048);

    assert!(read_image(&mut io::repeat(1), 2048, 512).is_err());
    assert!(read_image(&mut io::empty(), 2048, 512).is_err());
    Ok(())
}
