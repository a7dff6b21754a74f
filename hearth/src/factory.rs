//! Maps configuration to the one concrete service factory type the worker
//! pool is monomorphic over.

use std::{convert::Infallible, io, sync::Arc, time::Duration};

use hearth_core::{
    config::ListenerConfig,
    listener::{Accepted, ListenerBuilder},
    storage::Storage,
    AnyError,
};
use hearth_services::{
    common::TimeoutService,
    line::{CacheHandler, EchoHandler, LineService, RequestError, RequestHandler, DEFAULT_MAX_LINE},
    tcp::echo::EchoService,
};
use service_async::{AsyncMakeService, Service};

use crate::config::{ProtocolConfig, ServerConfig};

/// Request handlers available to configured servers.
#[derive(Clone)]
pub enum AppHandler {
    Echo(EchoHandler),
    Cache(CacheHandler),
}

impl RequestHandler for AppHandler {
    fn handle(&self, request: &str) -> Result<String, RequestError> {
        match self {
            AppHandler::Echo(handler) => handler.handle(request),
            AppHandler::Cache(handler) => handler.handle(request),
        }
    }
}

pub enum AppService {
    Echo(EchoService),
    Line(LineService<AppHandler>),
}

impl Service<Accepted> for AppService {
    type Response = ();
    type Error = AnyError;

    async fn call(&self, accept: Accepted) -> Result<Self::Response, Self::Error> {
        match self {
            AppService::Echo(service) => service.call(accept).await.map_err(Into::into),
            AppService::Line(service) => service.call(accept).await.map_err(Into::into),
        }
    }
}

#[derive(Clone)]
pub struct AppFactory {
    protocol: ProtocolFactory,
    timeout: Option<Duration>,
}

#[derive(Clone)]
enum ProtocolFactory {
    Echo(EchoService),
    Line(LineService<AppHandler>),
}

impl AsyncMakeService for AppFactory {
    type Service = TimeoutService<AppService>;
    type Error = Infallible;

    async fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let service = match &self.protocol {
            ProtocolFactory::Echo(factory) => AppService::Echo(factory.clone()),
            ProtocolFactory::Line(factory) => AppService::Line(factory.clone()),
        };
        Ok(TimeoutService::new(self.timeout, service))
    }
}

pub fn server_factory(config: &ServerConfig, storage: &Arc<dyn Storage>) -> AppFactory {
    let protocol = match &config.protocol {
        ProtocolConfig::Echo { buffer_size } => ProtocolFactory::Echo(EchoService::new(*buffer_size)),
        ProtocolConfig::LineEcho => {
            ProtocolFactory::Line(LineService::new(AppHandler::Echo(EchoHandler), DEFAULT_MAX_LINE))
        }
        ProtocolConfig::Cache => ProtocolFactory::Line(LineService::new(
            AppHandler::Cache(CacheHandler::new(storage.clone())),
            DEFAULT_MAX_LINE,
        )),
    };
    AppFactory {
        protocol,
        timeout: config.timeout_secs.map(Duration::from_secs),
    }
}

pub fn listener_factory(config: &ListenerConfig) -> io::Result<ListenerBuilder> {
    ListenerBuilder::try_from(config.clone())
}
