/// implement [packbytes] serialization for a bilge bitfield, using its underlying integer
#[macro_export]
macro_rules! pack_bilge {
    ($t:ty) => {

        impl packbytes::ToBytes for $t {
            type Bytes = [u8; core::mem::size_of::<$t>()];

            fn to_le_bytes(self) -> Self::Bytes {
                <$t as bilge::Bitsized>::ArbitraryInt::from(self).to_le_bytes()
            }
            fn to_be_bytes(self) -> Self::Bytes {
                <$t as bilge::Bitsized>::ArbitraryInt::from(self).to_be_bytes()
            }
        }
        impl packbytes::FromBytes for $t {
            type Bytes = [u8; core::mem::size_of::<$t>()];

            fn from_le_bytes(bytes: Self::Bytes) -> Self {
                <$t>::from(<$t as bilge::Bitsized>::ArbitraryInt::from_le_bytes(bytes))
            }
            fn from_be_bytes(bytes: Self::Bytes) -> Self {
                <$t>::from(<$t as bilge::Bitsized>::ArbitraryInt::from_be_bytes(bytes))
            }
        }
    };
}

/**
    copy a fixed width ASCII field into a string, stopping at the first NUL

    bytes outside the printable ASCII range are replaced by `?` so the result is always valid text
*/
pub fn ascii_field<const N: usize>(field: &[u8]) -> heapless::String<N> {
    let mut text = heapless::String::new();
    for &byte in field.iter().take(N) {
        if byte == 0
            {break}
        let c = if byte.is_ascii_graphic() || byte == b' ' {char::from(byte)} else {'?'};
        // cannot overflow, at most N single byte chars are pushed
        let _ = text.push(c);
    }
    text
}
