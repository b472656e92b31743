use bytes::Bytes;
use serde::Serialize;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
pub const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

/// Encode one value as a `data: <json>\n\n` frame.
pub fn data_frame<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Some(Bytes::from(data))
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let frame = data_frame(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(&frame[..], b"data: {\"a\":1}\n\n");
        assert_eq!(&done_frame()[..], b"data: [DONE]\n\n");
    }
}
