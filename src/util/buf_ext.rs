use anyhow::{anyhow, bail};
use bytes::Bytes;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// The largest value the remaining length field of a fixed header can carry
pub const MAX_REMAINING_LEN: usize = 268_435_455;

/// Extension methods for the length-prefixed encodings MQTT uses inside packet bodies
pub trait BufExt: bytes::Buf + VarIntSupport {
    fn try_get_remaining_len(&mut self) -> anyhow::Result<usize> {
        let len = self.try_get_u32_varint()? as usize;
        if len > MAX_REMAINING_LEN {
            bail!("remaining length {} exceeds the protocol maximum", len);
        }
        Ok(len)
    }

    fn try_get_mqtt_binary(&mut self) -> anyhow::Result<Bytes> {
        let len = self.try_get_u16()? as usize;
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow"));
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_get_mqtt_string(&mut self) -> anyhow::Result<String> {
        let raw = self.try_get_mqtt_binary()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

pub trait BufMutExt: bytes::BufMut + VarIntSupportMut {
    fn put_remaining_len(&mut self, len: usize) -> anyhow::Result<()> {
        if len > MAX_REMAINING_LEN {
            bail!("packet body of {} bytes exceeds the protocol maximum", len);
        }
        self.put_u32_varint(len as u32);
        Ok(())
    }

    fn put_mqtt_binary(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let len: u16 = data.len().try_into()
            .map_err(|_| anyhow!("length-prefixed field of {} bytes does not fit into 16 bits", data.len()))?;
        self.put_u16(len);
        self.put_slice(data);
        Ok(())
    }

    fn put_mqtt_string(&mut self, s: &str) -> anyhow::Result<()> {
        self.put_mqtt_binary(s.as_bytes())
    }
}

impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}
