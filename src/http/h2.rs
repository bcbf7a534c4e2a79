//! HTTP/2 request payload: client preface, Chrome-like SETTINGS, and one
//! HEADERS frame per request, with a minimal HPACK encoder (static-table
//! indexing and literals without indexing, no Huffman).

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Uri};

use crate::http::host_header;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const MAX_FRAME_SIZE: usize = 16 << 10;

const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_WINDOW_UPDATE: u8 = 0x8;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PRIORITY: u8 = 0x20;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

pub(crate) fn build_payload(method: &Method, uri: &Uri, user_agent: &str, requests: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(PREFACE);
    write_settings(
        &mut buf,
        &[
            (SETTINGS_HEADER_TABLE_SIZE, 65536),
            (SETTINGS_ENABLE_PUSH, 0),
            (SETTINGS_INITIAL_WINDOW_SIZE, 6_291_456),
            (SETTINGS_MAX_HEADER_LIST_SIZE, 262_144),
        ],
    );
    write_window_update(&mut buf, 0, 15_663_105);

    let mut block = BytesMut::new();
    encode_field(&mut block, ":method", method.as_str());
    encode_field(&mut block, ":authority", &host_header(uri));
    encode_field(&mut block, ":scheme", uri.scheme_str().unwrap_or("https"));
    encode_field(&mut block, ":path", uri.path_and_query().map(|p| p.as_str()).unwrap_or("/"));
    encode_field(&mut block, "user-agent", user_agent);

    for i in 0..requests {
        write_headers(&mut buf, i * 2 + 1, &block);
    }
    buf.freeze()
}

fn frame_header(buf: &mut BytesMut, len: usize, kind: u8, flags: u8, stream: u32) {
    buf.put_uint(len as u64, 3);
    buf.put_u8(kind);
    buf.put_u8(flags);
    buf.put_u32(stream & 0x7fff_ffff);
}

fn write_settings(buf: &mut BytesMut, settings: &[(u16, u32)]) {
    frame_header(buf, settings.len() * 6, FRAME_SETTINGS, 0, 0);
    for (id, value) in settings {
        buf.put_u16(*id);
        buf.put_u32(*value);
    }
}

fn write_window_update(buf: &mut BytesMut, stream: u32, increment: u32) {
    frame_header(buf, 4, FRAME_WINDOW_UPDATE, 0, stream);
    buf.put_u32(increment & 0x7fff_ffff);
}

/// One request: HEADERS with an exclusive priority on stream 0 (weight
/// 255), the block chunked at the frame limit with CONTINUATION.
fn write_headers(buf: &mut BytesMut, stream: u32, block: &[u8]) {
    let mut first = true;
    let mut rest = block;
    loop {
        let budget = if first { MAX_FRAME_SIZE - 5 } else { MAX_FRAME_SIZE };
        let (chunk, tail) = rest.split_at(rest.len().min(budget));
        rest = tail;
        let end_headers = rest.is_empty();
        if first {
            let mut flags = FLAG_END_STREAM | FLAG_PRIORITY;
            if end_headers {
                flags |= FLAG_END_HEADERS;
            }
            frame_header(buf, chunk.len() + 5, FRAME_HEADERS, flags, stream);
            // exclusive dependency on the connection stream
            buf.put_u32(0x8000_0000);
            buf.put_u8(255);
            buf.put_slice(chunk);
            first = false;
        } else {
            let flags = if end_headers { FLAG_END_HEADERS } else { 0 };
            frame_header(buf, chunk.len(), FRAME_CONTINUATION, flags, stream);
            buf.put_slice(chunk);
        }
        if end_headers {
            break;
        }
    }
}

fn encode_field(buf: &mut BytesMut, name: &str, value: &str) {
    if let Some(index) = static_full_index(name, value) {
        // indexed header field
        encode_int(buf, index, 7, 0x80);
        return;
    }
    match static_name_index(name) {
        // literal without indexing, indexed name
        Some(index) => encode_int(buf, index, 4, 0x00),
        None => {
            buf.put_u8(0);
            encode_str(buf, name);
        }
    }
    encode_str(buf, value);
}

fn encode_str(buf: &mut BytesMut, s: &str) {
    encode_int(buf, s.len() as u64, 7, 0x00);
    buf.put_slice(s.as_bytes());
}

/// HPACK prefixed integer encoding.
fn encode_int(buf: &mut BytesMut, mut value: u64, prefix_bits: u8, pattern: u8) {
    let max = (1u64 << prefix_bits) - 1;
    if value < max {
        buf.put_u8(pattern | value as u8);
        return;
    }
    buf.put_u8(pattern | max as u8);
    value -= max;
    while value >= 128 {
        buf.put_u8((value % 128) as u8 | 0x80);
        value /= 128;
    }
    buf.put_u8(value as u8);
}

fn static_full_index(name: &str, value: &str) -> Option<u64> {
    match (name, value) {
        (":method", "GET") => Some(2),
        (":method", "POST") => Some(3),
        (":path", "/") => Some(4),
        (":scheme", "http") => Some(6),
        (":scheme", "https") => Some(7),
        _ => None,
    }
}

fn static_name_index(name: &str) -> Option<u64> {
    match name {
        ":authority" => Some(1),
        ":method" => Some(2),
        ":path" => Some(4),
        ":scheme" => Some(6),
        "user-agent" => Some(58),
        _ => None,
    }
}
