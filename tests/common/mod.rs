//! Shared test infrastructure for servicekeel integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol as TransportProtocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

use servicekeel::source::{EndpointKind, Protocol};
use servicekeel::{ClusterStateSource, EndpointDescriptor, SidecarError, TunnelHandle, TunnelProcess};

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// The response is serialized via `MessageResponse::destructive_emit()` and stored
/// as raw wire-format bytes, which can then be parsed with `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query with one or more questions.
pub fn build_message_bytes(questions: &[(&str, RecordType)], op_code: OpCode, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(op_code);
    msg.set_recursion_desired(true);
    for (name, record_type) in questions {
        let mut query = Query::new();
        query.set_name(Name::from_ascii(name).unwrap());
        query.set_query_type(*record_type);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
    }
    msg.to_vec().unwrap()
}

/// Build wire-format bytes for a single-question DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    build_message_bytes(&[(name, record_type)], OpCode::Query, id)
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Wrap wire bytes into a `Request` from a loopback client.
pub fn build_request(bytes: &[u8]) -> Request {
    let src: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    Request::new(parse_message_request(bytes), src, TransportProtocol::Udp)
}

// --- Response helpers ---

/// Run raw query bytes through a handler and return the parsed response.
pub async fn execute_bytes<H: RequestHandler>(handler: &H, bytes: &[u8]) -> Message {
    let request = build_request(bytes);
    let response = TestResponseHandler::new();
    handler.handle_request(&request, response.clone()).await;
    response.into_message()
}

/// Run a single-question query through a handler.
pub async fn execute_query<H: RequestHandler>(handler: &H, name: &str, record_type: RecordType) -> Message {
    execute_bytes(handler, &build_query_bytes(name, record_type, 1)).await
}

/// Extract A addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert response is successful with exactly the expected IPs.
pub fn assert_a_response(msg: &Message, expected_ips: &[Ipv4Addr]) {
    assert_response_code(msg, ResponseCode::NoError);
    let mut actual = extract_a_ips(msg);
    actual.sort();
    let mut expected: Vec<Ipv4Addr> = expected_ips.to_vec();
    expected.sort();
    assert_eq!(
        actual, expected,
        "A records mismatch.\nactual:   {:?}\nexpected: {:?}",
        actual, expected
    );
}

// --- Endpoint fixtures ---

/// Import endpoint for `service` on `port`.
pub fn descriptor(service: &str, port: u16) -> EndpointDescriptor {
    descriptor_of(service, port, EndpointKind::Import)
}

/// Endpoint of the given `kind` for `service` on `port`.
pub fn descriptor_of(service: &str, port: u16, kind: EndpointKind) -> EndpointDescriptor {
    EndpointDescriptor {
        identity: format!("{service}:{port}/tcp"),
        service_name: service.to_string(),
        port,
        protocol: Protocol::Tcp,
        tunnel_server_address: "frps.remote".to_string(),
        tunnel_server_port: 7000,
        secret: "secret".to_string(),
        kind,
    }
}

// --- FakeSource ---

/// In-memory desired state that can be switched between cycles.
#[derive(Default)]
pub struct FakeSource {
    desired: Mutex<Vec<EndpointDescriptor>>,
    failure: Mutex<Option<String>>,
    fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new(desired: Vec<EndpointDescriptor>) -> Arc<Self> {
        let source = Self::default();
        *source.desired.lock().unwrap() = desired;
        Arc::new(source)
    }

    pub fn set(&self, desired: Vec<EndpointDescriptor>) {
        *self.desired.lock().unwrap() = desired;
    }

    /// Make every fetch fail until `recover` is called.
    pub fn fail(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterStateSource for FakeSource {
    async fn fetch_endpoints(&self, watch_list: &[String]) -> Result<Vec<EndpointDescriptor>, SidecarError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.failure.lock().unwrap().clone() {
            return Err(SidecarError::DesiredStateFetch(reason));
        }
        Ok(self
            .desired
            .lock()
            .unwrap()
            .iter()
            .filter(|d| watch_list.contains(&d.service_name))
            .cloned()
            .collect())
    }
}

// --- FakeTunnels ---

/// Records tunnel starts and stops instead of spawning processes.
#[derive(Default)]
pub struct FakeTunnels {
    next_id: AtomicU64,
    running: Mutex<HashMap<u64, (String, Option<Ipv4Addr>)>>,
    fail_start: Mutex<HashSet<String>>,
    fail_stop: Mutex<HashSet<String>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeTunnels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `start` fail for `identity`.
    pub fn fail_start(&self, identity: &str) {
        self.fail_start.lock().unwrap().insert(identity.to_string());
    }

    /// Make `stop` fail for `identity` (the tunnel still counts as stopped).
    pub fn fail_stop(&self, identity: &str) {
        self.fail_stop.lock().unwrap().insert(identity.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_start.lock().unwrap().clear();
        self.fail_stop.lock().unwrap().clear();
    }

    /// Running tunnels as (identity, bound IP), sorted by identity.
    pub fn running(&self) -> Vec<(String, Option<Ipv4Addr>)> {
        let mut running: Vec<_> = self.running.lock().unwrap().values().cloned().collect();
        running.sort();
        running
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelProcess for FakeTunnels {
    async fn start(
        &self,
        identity: &str,
        _descriptor: &EndpointDescriptor,
        virtual_ip: Option<Ipv4Addr>,
    ) -> Result<TunnelHandle, SidecarError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.lock().unwrap().contains(identity) {
            return Err(SidecarError::TunnelStart {
                identity: identity.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.running
            .lock()
            .unwrap()
            .insert(id, (identity.to_string(), virtual_ip));
        Ok(TunnelHandle {
            id,
            identity: identity.to_string(),
        })
    }

    async fn stop(&self, handle: &TunnelHandle) -> Result<(), SidecarError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.lock().unwrap().remove(&handle.id);
        if self.fail_stop.lock().unwrap().contains(&handle.identity) {
            return Err(SidecarError::TunnelStop {
                identity: handle.identity.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}
