pub type SerializeResult = anyhow::Result<()>;

pub trait Serializer {
    fn write_bytes(&mut self, fragment: &[u8]) -> SerializeResult;
}

/// Serializes into an owned, growable buffer. Packet sizes are not known in
/// advance (APP payloads are arbitrary length), so unlike a fixed-capacity
/// slice serializer this can never overflow.
pub struct VecSerializer {
    data: Vec<u8>,
}

impl VecSerializer {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(initial_capacity),
        }
    }

    pub fn take(self) -> Vec<u8> {
        self.data
    }
}

impl Serializer for VecSerializer {
    fn write_bytes(&mut self, fragment: &[u8]) -> SerializeResult {
        self.data.extend_from_slice(fragment);
        Ok(())
    }
}

pub trait Serialize {
    type Input: ?Sized;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult;
}

impl Serialize for u8 {
    type Input = u8;
    fn serialize<S: Serializer>(value: &u8, ser: &mut S) -> SerializeResult {
        ser.write_bytes(&[*value])
    }
}

impl Serialize for u16 {
    type Input = u16;
    fn serialize<S: Serializer>(value: &u16, ser: &mut S) -> SerializeResult {
        ser.write_bytes(&value.to_be_bytes())
    }
}

impl Serialize for u32 {
    type Input = u32;
    fn serialize<S: Serializer>(value: &u32, ser: &mut S) -> SerializeResult {
        ser.write_bytes(&value.to_be_bytes())
    }
}

impl Serialize for u64 {
    type Input = u64;
    fn serialize<S: Serializer>(value: &u64, ser: &mut S) -> SerializeResult {
        ser.write_bytes(&value.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_primitives_big_endian() {
        let mut ser = VecSerializer::new(8);
        u8::serialize(&0xAB, &mut ser).unwrap();
        u16::serialize(&0x0102, &mut ser).unwrap();
        assert_eq!(ser.take(), vec![0xAB, 0x01, 0x02]);
    }
}
