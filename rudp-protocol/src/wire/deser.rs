use anyhow::bail;

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("EOF during deserialization")]
    Eof,
    #[error("Invalid command byte: {0}")]
    InvalidCommand(u8),
}

pub type DeserializeResult<R> = anyhow::Result<R>;

/// A cursor over the remaining bytes of a datagram being decoded.
pub struct Deserializer<'a> {
    data: &'a [u8],
}

impl<'a> Deserializer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn peek(&self, count: usize) -> DeserializeResult<&'a [u8]> {
        if count > self.data.len() {
            bail!(DeserializeError::Eof)
        } else {
            Ok(&self.data[0..count])
        }
    }

    pub fn take(&mut self, count: usize) -> DeserializeResult<&'a [u8]> {
        if count > self.data.len() {
            bail!(DeserializeError::Eof)
        } else {
            let ret;
            (ret, self.data) = self.data.split_at(count);
            Ok(ret)
        }
    }

    pub fn take_n<const N: usize>(&mut self) -> DeserializeResult<[u8; N]> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    pub fn take_all(&mut self) -> &'a [u8] {
        let ret;
        (ret, self.data) = self.data.split_at(self.data.len());
        ret
    }
}

pub trait Deserialize: Sized {
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self>;
}

impl Deserialize for u8 {
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(deser.take_n::<1>()?[0])
    }
}

impl Deserialize for u16 {
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(u16::from_be_bytes(deser.take_n::<2>()?))
    }
}

impl Deserialize for u32 {
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(u32::from_be_bytes(deser.take_n::<4>()?))
    }
}

impl Deserialize for u64 {
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(u64::from_be_bytes(deser.take_n::<8>()?))
    }
}
