use std::{convert::Infallible, io};

use hearth_core::listener::AcceptedAddr;
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};
use service_async::{AsyncMakeService, MakeService, Service};

#[derive(Debug, Clone)]
pub struct EchoConfig {
    pub buffer_size: usize,
}

pub const DEFAULT_ECHO_BUFFER_SIZE: usize = 1024;

/// Relays every byte back to the peer until it closes the connection.
#[derive(Debug, Clone)]
pub struct EchoService {
    buffer_size: usize,
}

impl EchoService {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

impl<S> Service<(S, AcceptedAddr)> for EchoService
where
    S: AsyncReadRent + AsyncWriteRent,
{
    type Response = ();
    type Error = io::Error;

    async fn call(&self, (mut io, addr): (S, AcceptedAddr)) -> Result<Self::Response, Self::Error> {
        tracing::debug!("echo connection from {addr:?}");
        let mut buffer = Vec::with_capacity(self.buffer_size);
        loop {
            let (mut r, buf) = io.read(buffer).await;
            if r? == 0 {
                break;
            }
            (r, buffer) = io.write_all(buf).await;
            r?;
        }
        tracing::info!("tcp relay finished successfully");
        Ok(())
    }
}

impl MakeService for EchoService {
    type Service = Self;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(EchoService {
            buffer_size: self.buffer_size,
        })
    }
}

impl AsyncMakeService for EchoService {
    type Service = Self;
    type Error = Infallible;

    async fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(EchoService {
            buffer_size: self.buffer_size,
        })
    }
}
