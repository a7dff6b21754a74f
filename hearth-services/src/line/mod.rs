//! Newline-delimited request/response protocol.
//!
//! Each request is one line; the service decodes it, hands it to the
//! configured [`RequestHandler`] and writes `+<response>\n` back, or
//! `-ERR <reason>\n` when the single request is bad. A bad request never
//! ends the connection; only an io error or the peer closing does.

use std::{convert::Infallible, io, sync::Arc};

use hearth_core::listener::AcceptedAddr;
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};
use service_async::{AsyncMakeService, MakeService, Service};
use tracing::debug;

mod cache;
pub use cache::CacheHandler;

pub const DEFAULT_MAX_LINE: usize = 8 * 1024;
const READ_CHUNK: usize = 4096;

/// A request that could not be served. Answered in-band on the same
/// connection; the accept/handle loop never sees it.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed request: {0}")]
    Malformed(&'static str),
}

/// Decoded-request collaborator: maps one request line to a response body.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: &str) -> Result<String, RequestError>;
}

/// Answers every request with itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, request: &str) -> Result<String, RequestError> {
        Ok(request.to_string())
    }
}

pub struct LineService<H> {
    handler: Arc<H>,
    max_line: usize,
}

impl<H> Clone for LineService<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            max_line: self.max_line,
        }
    }
}

impl<H> LineService<H> {
    pub fn new(handler: H, max_line: usize) -> Self {
        Self {
            handler: Arc::new(handler),
            max_line,
        }
    }
}

impl<H: RequestHandler> LineService<H> {
    fn respond(&self, line: &[u8]) -> Vec<u8> {
        match std::str::from_utf8(strip_eol(line)) {
            Err(_) => b"-ERR request is not valid utf-8\n".to_vec(),
            Ok(request) => match self.handler.handle(request.trim()) {
                Ok(response) => format!("+{response}\n").into_bytes(),
                Err(e) => format!("-ERR {e}\n").into_bytes(),
            },
        }
    }
}

fn strip_eol(mut line: &[u8]) -> &[u8] {
    if let [head @ .., b'\n'] = line {
        line = head;
    }
    if let [head @ .., b'\r'] = line {
        line = head;
    }
    line
}

impl<H, S> Service<(S, AcceptedAddr)> for LineService<H>
where
    H: RequestHandler,
    S: AsyncReadRent + AsyncWriteRent,
{
    type Response = ();
    type Error = io::Error;

    async fn call(&self, (mut io, addr): (S, AcceptedAddr)) -> Result<Self::Response, Self::Error> {
        debug!("line connection from {addr:?}");
        let mut pending: Vec<u8> = Vec::new();
        // set while skipping the remainder of an oversized request
        let mut discarding = false;
        loop {
            let (res, buf) = io.read(Vec::with_capacity(READ_CHUNK)).await;
            let n = res?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&buf);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if discarding {
                    // tail of an oversized request, already answered
                    discarding = false;
                    continue;
                }
                let reply = self.respond(&line);
                let (res, _) = io.write_all(reply).await;
                res?;
            }
            if !discarding && pending.len() > self.max_line {
                // answer once, then resynchronize at the next newline
                pending.clear();
                discarding = true;
                let (res, _) = io.write_all(b"-ERR request line too long\n".to_vec()).await;
                res?;
            } else if discarding {
                pending.clear();
            }
        }
        Ok(())
    }
}

impl<H> MakeService for LineService<H> {
    type Service = Self;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(self.clone())
    }
}

impl<H> AsyncMakeService for LineService<H> {
    type Service = Self;
    type Error = Infallible;

    async fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, io, rc::Rc};

    use hearth_core::listener::AcceptedAddr;
    use monoio::{
        buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
        io::{AsyncReadRent, AsyncWriteRent},
        BufResult,
    };
    use service_async::Service;

    use super::{LineService, RequestError, RequestHandler};

    // In-memory stream: serves scripted read chunks, captures writes.
    struct ScriptedStream {
        input: VecDeque<Vec<u8>>,
        output: Rc<RefCell<Vec<u8>>>,
    }

    impl ScriptedStream {
        fn new(chunks: &[&[u8]]) -> (Self, Rc<RefCell<Vec<u8>>>) {
            let output = Rc::new(RefCell::new(Vec::new()));
            (
                Self {
                    input: chunks.iter().map(|c| c.to_vec()).collect(),
                    output: output.clone(),
                },
                output,
            )
        }
    }

    impl AsyncReadRent for ScriptedStream {
        async fn read<T: IoBufMut>(&mut self, mut buf: T) -> BufResult<usize, T> {
            let Some(chunk) = self.input.pop_front() else {
                return (Ok(0), buf);
            };
            let n = chunk.len().min(buf.bytes_total());
            unsafe {
                std::ptr::copy_nonoverlapping(chunk.as_ptr(), buf.write_ptr(), n);
                buf.set_init(n);
            }
            (Ok(n), buf)
        }

        async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
            (Ok(0), buf)
        }
    }

    impl AsyncWriteRent for ScriptedStream {
        async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
            let slice = unsafe { std::slice::from_raw_parts(buf.read_ptr(), buf.bytes_init()) };
            self.output.borrow_mut().extend_from_slice(slice);
            (Ok(slice.len()), buf)
        }

        async fn writev<T: IoVecBuf>(&mut self, buf: T) -> BufResult<usize, T> {
            (Ok(0), buf)
        }

        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FussyHandler;

    impl RequestHandler for FussyHandler {
        fn handle(&self, request: &str) -> Result<String, RequestError> {
            if request == "boom" {
                return Err(RequestError::Malformed("no boom"));
            }
            Ok(format!("ack {request}"))
        }
    }

    fn peer() -> AcceptedAddr {
        AcceptedAddr::from("127.0.0.1:9".parse::<std::net::SocketAddr>().unwrap())
    }

    #[monoio::test]
    async fn requests_split_across_reads_are_reassembled() {
        let service = LineService::new(FussyHandler, 64);
        let (stream, output) = ScriptedStream::new(&[b"hi\nbo".as_slice(), b"om\nthere\n".as_slice()]);
        service.call((stream, peer())).await.unwrap();
        assert_eq!(
            String::from_utf8(output.borrow().clone()).unwrap(),
            "+ack hi\n-ERR malformed request: no boom\n+ack there\n"
        );
    }

    #[monoio::test]
    async fn bad_request_does_not_end_the_connection() {
        let service = LineService::new(FussyHandler, 64);
        let (stream, output) = ScriptedStream::new(&[b"boom\n".as_slice(), b"ok\n".as_slice()]);
        service.call((stream, peer())).await.unwrap();
        assert_eq!(
            String::from_utf8(output.borrow().clone()).unwrap(),
            "-ERR malformed request: no boom\n+ack ok\n"
        );
    }

    #[monoio::test]
    async fn oversized_line_is_answered_once_and_resynced() {
        let service = LineService::new(FussyHandler, 8);
        let (stream, output) = ScriptedStream::new(&[b"AAAAAAAAAAAAAAA".as_slice(), b"AAA\nok\n".as_slice()]);
        service.call((stream, peer())).await.unwrap();
        assert_eq!(
            String::from_utf8(output.borrow().clone()).unwrap(),
            "-ERR request line too long\n+ack ok\n"
        );
    }

    #[monoio::test]
    async fn carriage_returns_are_stripped() {
        let service = LineService::new(FussyHandler, 64);
        let (stream, output) = ScriptedStream::new(&[b"hi\r\n".as_slice()]);
        service.call((stream, peer())).await.unwrap();
        assert_eq!(
            String::from_utf8(output.borrow().clone()).unwrap(),
            "+ack hi\n"
        );
    }
}
