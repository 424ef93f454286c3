//! Little-endian stream helpers for the binary model format.

use std::io::{self, Read, Write};

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn u32_roundtrip() {
        let mut buf = Vec::new();
        write_u32_le(&mut buf, 0xDEAD_BEEF).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_u32_le(&mut cursor).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn f32_roundtrip_is_bit_exact() {
        let mut buf = Vec::new();
        write_f32_le(&mut buf, -0.0f32).unwrap();
        write_f32_le(&mut buf, f32::MIN_POSITIVE).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_f32_le(&mut cursor).unwrap().to_bits(), (-0.0f32).to_bits());
        assert_eq!(read_f32_le(&mut cursor).unwrap(), f32::MIN_POSITIVE);
    }
}
