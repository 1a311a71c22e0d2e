use std::io;

/// Writes a value into a frame body.
///
/// Implementors push their fixed part into `buf` and may hand back a borrowed
/// tail that the sender writes right after it without copying.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}

/// Reads a value out of a received frame body, possibly borrowing from it.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
