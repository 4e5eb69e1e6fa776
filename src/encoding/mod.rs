use anyhow::bail;

/// Little-endian, length-prefixed binary writer used for itemset and child
/// blobs.
#[derive(Debug, Default)]
pub struct BlobWriter {
    pub(crate) buf: Vec<u8>,
}

impl BlobWriter {
    pub fn new() -> Self {
        BlobWriter { buf: Vec::new() }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn write(&mut self, buf: &[u8]) {
        self.buf.extend_from_slice(buf);
    }

    fn write_len(&mut self, len: usize) {
        self.write(&(len as u64).to_le_bytes());
    }
}

pub struct BlobReader<'a> {
    buf: &'a [u8],
    from: usize,
}

impl<'a> BlobReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BlobReader { buf, from: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.buf.len()
    }

    pub fn next(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.buf.len() - self.from < n {
            bail!(
                "unexpected end of blob: wanted {} bytes at offset {}, have {}",
                n,
                self.from,
                self.buf.len() - self.from
            );
        }
        let result = &self.buf[self.from..self.from + n];
        self.from += n;
        Ok(result)
    }

    fn next_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        Ok(self.next(N)?.try_into()?)
    }

    fn next_len(&mut self) -> anyhow::Result<usize> {
        let len = u64::from_le_bytes(self.next_array()?);
        // Every encoded element takes at least one byte, so anything longer
        // than what is left cannot be valid.
        if len > (self.buf.len() - self.from) as u64 {
            bail!("length prefix {} exceeds remaining blob", len);
        }
        Ok(len as usize)
    }
}

pub trait Encode: std::fmt::Debug {
    fn write_bytes(&self, w: &mut BlobWriter);
}

pub trait Decode: Sized {
    fn decode(r: &mut BlobReader) -> anyhow::Result<Self>;
}

/// Encodes a single value into a fresh buffer.
pub fn encode_to_vec<T: Encode + ?Sized>(v: &T) -> Vec<u8> {
    let mut w = BlobWriter::new();
    v.write_bytes(&mut w);
    w.into_inner()
}

/// Decodes a single value and checks nothing trails it.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> anyhow::Result<T> {
    let mut r = BlobReader::new(buf);
    let result = T::decode(&mut r)?;
    if !r.is_empty() {
        bail!("{} trailing bytes after value", buf.len() - r.from);
    }
    Ok(result)
}

macro_rules! fixed_width {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn write_bytes(&self, w: &mut BlobWriter) {
                    w.write(&self.to_le_bytes())
                }
            }

            impl Decode for $t {
                fn decode(r: &mut BlobReader) -> anyhow::Result<Self> {
                    Ok(Self::from_le_bytes(r.next_array()?))
                }
            }
        )*
    };
}

fixed_width!(u8, u16, u32, u64, i32, i64);

impl Encode for usize {
    fn write_bytes(&self, w: &mut BlobWriter) {
        (*self as u64).write_bytes(w)
    }
}

impl Decode for usize {
    fn decode(r: &mut BlobReader) -> anyhow::Result<Self> {
        Ok(u64::decode(r)?.try_into()?)
    }
}

impl Encode for bool {
    fn write_bytes(&self, w: &mut BlobWriter) {
        w.write(&[*self as u8])
    }
}

impl Decode for bool {
    fn decode(r: &mut BlobReader) -> anyhow::Result<Self> {
        match u8::decode(r)? {
            0 => Ok(false),
            1 => Ok(true),
            x => bail!("invalid bool tag {}", x),
        }
    }
}

impl Encode for String {
    fn write_bytes(&self, w: &mut BlobWriter) {
        self.as_str().write_bytes(w)
    }
}

impl Encode for str {
    fn write_bytes(&self, w: &mut BlobWriter) {
        w.write_len(self.len());
        w.write(self.as_bytes())
    }
}

impl Decode for String {
    fn decode(r: &mut BlobReader) -> anyhow::Result<Self> {
        let len = r.next_len()?;
        Ok(String::from_utf8(r.next(len)?.to_vec())?)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn write_bytes(&self, w: &mut BlobWriter) {
        self.as_slice().write_bytes(w)
    }
}

impl<T: Encode> Encode for [T] {
    fn write_bytes(&self, w: &mut BlobWriter) {
        w.write_len(self.len());
        for v in self {
            v.write_bytes(w);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(r: &mut BlobReader) -> anyhow::Result<Self> {
        let len = r.next_len()?;
        let mut result = Vec::with_capacity(len);
        for _ in 0..len {
            result.push(T::decode(r)?);
        }
        Ok(result)
    }
}

impl<A> Encode for &A
where
    A: Encode + ?Sized,
{
    fn write_bytes(&self, w: &mut BlobWriter) {
        (*self).write_bytes(w)
    }
}

impl<A, B> Encode for (A, B)
where
    A: Encode,
    B: Encode,
{
    fn write_bytes(&self, w: &mut BlobWriter) {
        self.0.write_bytes(w);
        self.1.write_bytes(w);
    }
}

impl<A, B> Decode for (A, B)
where
    A: Decode,
    B: Decode,
{
    fn decode(r: &mut BlobReader) -> anyhow::Result<Self> {
        let a = A::decode(r)?;
        let b = B::decode(r)?;
        Ok((a, b))
    }
}

impl<A> Encode for Option<A>
where
    A: Encode,
{
    fn write_bytes(&self, w: &mut BlobWriter) {
        match self {
            None => w.write(&[0]),
            Some(v) => {
                w.write(&[1]);
                v.write_bytes(w);
            }
        }
    }
}

impl<A> Decode for Option<A>
where
    A: Decode,
{
    fn decode(r: &mut BlobReader) -> anyhow::Result<Self> {
        match u8::decode(r)? {
            0 => Ok(None),
            1 => Ok(Some(A::decode(r)?)),
            x => bail!("invalid option tag {}", x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested() {
        let v: Vec<(String, Option<u32>)> = vec![
            ("a".into(), Some(7)),
            ("".into(), None),
            ("\u{0}\u{1}zz".into(), Some(u32::MAX)),
        ];
        let buf = encode_to_vec(&v);
        let back: Vec<(String, Option<u32>)> = decode_from_slice(&buf).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_truncated() {
        let buf = encode_to_vec(&vec![1_u64, 2, 3]);
        assert!(decode_from_slice::<Vec<u64>>(&buf[..buf.len() - 1]).is_err());
        // A length prefix promising more than the buffer holds.
        let mut bad = buf.clone();
        bad[0] = 200;
        assert!(decode_from_slice::<Vec<u64>>(&bad).is_err());
    }

    #[test]
    fn test_trailing() {
        let mut buf = encode_to_vec(&5_i32);
        buf.push(0);
        assert!(decode_from_slice::<i32>(&buf).is_err());
        assert_eq!(decode_from_slice::<i32>(&buf[..4]).unwrap(), 5);
    }

    #[test]
    fn test_invalid_tags() {
        assert!(decode_from_slice::<bool>(&[2]).is_err());
        assert!(decode_from_slice::<Option<u8>>(&[3, 0]).is_err());
    }
}
