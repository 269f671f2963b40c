//! Helper functions for integration tests

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use hostwatch::config::{Config, HttpEndpoint, parse_config};
use hostwatch::dispatch::Destination;
use hostwatch::sink::{LogSink, SinkOutput};

/// Shared in-memory writer for sink output
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn captured_sink() -> (LogSink, Captured) {
    let captured = Captured::default();
    let sink = LogSink::builder()
        .output(SinkOutput::Writer(Box::new(captured.clone())))
        .build()
        .unwrap();
    (sink, captured)
}

pub fn config(json: serde_json::Value) -> Config {
    parse_config(&json.to_string(), false).unwrap()
}

pub fn http(url: impl Into<String>) -> Destination {
    Destination::Http(HttpEndpoint {
        url: url.into(),
        timeout_secs: 2,
        ..Default::default()
    })
}

/// A local port nothing listens on
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
