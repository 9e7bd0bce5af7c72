use std::io;

pub trait Serialize<'a> {
    /// Writes `self` into `buf`, optionally returning a borrowed tail that is sent
    /// right after the buffer without being copied into it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
