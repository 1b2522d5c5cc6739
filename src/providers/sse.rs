/// One server-sent event read from a provider stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Pops the next complete event off `buffer`.
/// Returns `None` until a blank-line terminated frame with at least one `data:` line is buffered.
pub fn extract_sse_frame(buffer: &mut String) -> Option<SseFrame> {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    loop {
        let pos = buffer.find("\n\n")?;
        let raw = buffer[..pos].to_string();
        buffer.drain(..pos + 2);

        let mut event = None;
        let mut data_lines = Vec::new();
        for line in raw.lines() {
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("event:") {
                event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }

        // comments and keep-alives carry no data
        if data_lines.is_empty() {
            continue;
        }

        return Some(SseFrame {
            event,
            data: data_lines.join("\n"),
        });
    }
}

/// Appends the decodable part of `pending` to `buffer`.
/// A character cut off at the end of a chunk stays in `pending` until the next chunk completes it;
/// bytes that can never be valid become U+FFFD.
pub fn drain_utf8(pending: &mut Vec<u8>, buffer: &mut String) {
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                buffer.push_str(text);
                pending.clear();
                return;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                buffer.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    None => {
                        pending.drain(..valid);
                        return;
                    }
                    Some(invalid) => {
                        buffer.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + invalid);
                    }
                }
            }
        }
    }
}
