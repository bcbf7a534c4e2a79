use std::future::Future;
use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};
use crate::tcp::reader::ReliableReader;

const READ_CHUNK: usize = 16 * 1024;

type ReadFut = Pin<Box<dyn Future<Output = Result<BytesMut>> + Send>>;

/// Presents a [`ReliableReader`]-backed connection as a full-duplex byte
/// stream so an external TLS client can handshake over it.
///
/// `Close` and write deadlines are no-ops (the connection owns the
/// lifetime); the read deadline is the reader's. Once detached via
/// [`StreamDetach`], reads and writes fail with `Closed`.
pub struct FlowStream {
    shared: Arc<Mutex<Option<Arc<ReliableReader>>>>,
    last_buf: Option<BytesMut>,
    in_flight: Option<ReadFut>,
}

/// Clears the reader out of a [`FlowStream`] that has been moved into a TLS
/// client, used when the stack hands the connection off after the handshake.
pub struct StreamDetach {
    shared: Arc<Mutex<Option<Arc<ReliableReader>>>>,
}

impl StreamDetach {
    pub fn detach(&self) {
        self.shared.lock().take();
    }
}

impl FlowStream {
    pub fn new(reader: Arc<ReliableReader>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Some(reader))),
            last_buf: None,
            in_flight: None,
        }
    }

    pub fn detach_handle(&self) -> StreamDetach {
        StreamDetach {
            shared: self.shared.clone(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.reader().and_then(|r| r.writer().conn()).map(|c| c.local_addr())
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.reader().and_then(|r| r.writer().conn()).map(|c| c.peer_addr())
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        if let Some(reader) = self.reader() {
            reader.set_read_deadline(deadline);
        }
    }

    fn reader(&self) -> Option<Arc<ReliableReader>> {
        self.shared.lock().clone()
    }
}

impl AsyncRead for FlowStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(p) = this.last_buf.as_mut() {
            let len = buf.remaining().min(p.len());
            buf.put_slice(&p[..len]);
            p.advance(len);
            if p.is_empty() {
                this.last_buf.take();
            }
            return Poll::Ready(Ok(()));
        }

        let mut fut: ReadFut = match this.in_flight.take() {
            Some(fut) => fut,
            None => {
                let Some(reader) = this.reader() else {
                    return Poll::Ready(Err(Error::Closed.into()));
                };
                Box::pin(async move {
                    let mut tmp = BytesMut::zeroed(READ_CHUNK);
                    let n = reader.read(&mut tmp).await?;
                    tmp.truncate(n);
                    Ok(tmp)
                })
            }
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(mut p)) => {
                let len = buf.remaining().min(p.len());
                buf.put_slice(&p[..len]);
                p.advance(len);
                if !p.is_empty() {
                    this.last_buf.replace(p);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => {
                this.in_flight.replace(fut);
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for FlowStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(reader) = this.reader() else {
            return Poll::Ready(Err(Error::Closed.into()));
        };
        match reader.write(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // the outer connection owns the lifetime
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlink::{wscale_options, MockLink};
    use crate::tcp::TcpConn;
    use pnet_packet::tcp::TcpFlags::{ACK, SYN};
    use pnet_packet::tcp::TcpPacket;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn dial(link: &Arc<MockLink>, port: u16) -> (Arc<TcpConn>, Arc<ReliableReader>) {
        let reader = ReliableReader::new();
        let conn = TcpConn::dial_with_iss(link.clone(), link.peer(), port, reader.clone(), 1000).unwrap();
        let seg = link.peer_segment(5000, 1001, SYN | ACK, 64, &[], Some(&wscale_options(1400, 7)));
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        link.clear();
        (conn, reader)
    }

    #[tokio::test]
    async fn test_write_goes_out_as_segments() {
        let link = MockLink::new();
        let (conn, reader) = dial(&link, 44000);
        let mut stream = FlowStream::new(reader);

        stream.write_all(b"client hello").await.unwrap();
        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        let tcp = TcpPacket::new(&sent[0]).unwrap();
        assert_eq!(&sent[0][tcp.get_data_offset() as usize * 4..], b"client hello");
        assert_eq!(conn.seq(), 1001 + 12);
    }

    #[tokio::test]
    async fn test_read_delivers_peer_bytes() {
        let link = MockLink::new();
        let (conn, reader) = dial(&link, 44001);
        let mut stream = FlowStream::new(reader);
        assert_eq!(stream.peer_addr(), Some(link.peer()));

        let seg = link.peer_segment(5001, 1001, ACK, 64, b"server hello", None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());

        let mut out = [0u8; 5];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"serve");
        // the leftover chunk feeds the next read
        let mut rest = [0u8; 7];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"r hello");
    }

    #[tokio::test]
    async fn test_detached_stream_is_closed() {
        let link = MockLink::new();
        let (_conn, reader) = dial(&link, 44002);
        let mut stream = FlowStream::new(reader);
        stream.detach_handle().detach();

        assert!(stream.write_all(b"x").await.is_err());
        let mut out = [0u8; 4];
        assert!(stream.read(&mut out).await.is_err());
    }
}
