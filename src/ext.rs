//! Buffer extension helpers shared by the codec.
use bytes::{Buf, BufMut, Bytes};

/// Integer signess in the protocol docs is awful.
pub(crate) trait UsizeExt {
    /// Lengths are `usize` in rust while the wire wants `i32`,
    /// this panics on overflow instead of wrapping.
    fn to_i32(self) -> i32;
    /// Lengths are `usize` in rust while the wire wants `u16`,
    /// this panics on overflow instead of wrapping.
    fn to_u16(self) -> u16;
}

impl UsizeExt for usize {
    fn to_i32(self) -> i32 {
        self.try_into().expect("message size too large for protocol")
    }

    fn to_u16(self) -> u16 {
        self.try_into().expect("message size too large for protocol")
    }
}

pub(crate) trait BufMutExt {
    /// Protocol strings are nul terminated.
    fn put_nul_str(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_str(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

pub(crate) trait BytesExt {
    /// Split off bytes up to the next nul terminator, consuming it.
    ///
    /// Returns [`None`] when no terminator is found.
    fn get_nul_bytes(&mut self) -> Option<Bytes>;

    /// [`get_nul_bytes`][BytesExt::get_nul_bytes] validated as UTF-8.
    fn get_nul_string(&mut self) -> Option<String>;
}

impl BytesExt for Bytes {
    fn get_nul_bytes(&mut self) -> Option<Bytes> {
        let end = self.iter().position(|b| *b == b'\0')?;
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        Some(me)
    }

    fn get_nul_string(&mut self) -> Option<String> {
        String::from_utf8(self.get_nul_bytes()?.into()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn nul_strings_round_trip() {
        let mut buf = BytesMut::new();
        buf.put_nul_str("application_name");
        buf.put_nul_str("");

        let mut bytes = buf.freeze();
        assert_eq!(bytes.get_nul_string().as_deref(), Some("application_name"));
        assert_eq!(bytes.get_nul_string().as_deref(), Some(""));
        assert!(bytes.get_nul_string().is_none());
    }

    #[test]
    fn non_utf8_string_is_rejected() {
        let mut bytes = Bytes::from_static(b"\xff\xfe\0");
        assert!(bytes.get_nul_string().is_none());
    }
}
