//! DNS request handler answering from the virtual IP pool.
//!
//! Every question in a request is looked at:
//! - `A`: resolved against [`DnsState`], one answer on a hit;
//! - `AAAA`: never answered, so clients fall back to the IPv4 answer;
//! - anything else: ignored.
//!
//! The response is authoritative `NOERROR` if there is at least one answer,
//! `NXDOMAIN` if an `A` question went unanswered, and empty `NOERROR`
//! otherwise.

use async_trait::async_trait;
use hickory_proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::{debug, warn};

use crate::metrics::{self, QueryResult, Timer};
use crate::state::DnsState;

/// Default TTL for hijacked answers, in seconds.
pub const DEFAULT_TTL: u32 = 5;

/// Longest TTL accepted for hijacked answers. Mappings can move on every
/// reconcile cycle, so clients must not cache them for long.
pub const MAX_TTL: u32 = 9;

/// Answers A queries for mapped names with their virtual IP.
#[derive(Debug, Clone)]
pub struct HijackHandler {
    state: DnsState,
    ttl: u32,
}

impl HijackHandler {
    /// Create a handler answering from `state`.
    pub fn new(state: DnsState) -> Self {
        Self {
            state,
            ttl: DEFAULT_TTL,
        }
    }

    /// Override the answer TTL.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolver state backing this handler.
    pub fn state(&self) -> &DnsState {
        &self.state
    }

    /// Build the answer section and response code for a query message.
    fn answer(&self, request: &Request) -> (Vec<Record>, ResponseCode) {
        let mut answers = Vec::new();
        let mut unanswered_a = false;

        for query in request.queries() {
            let timer = Timer::start();
            let record_type = query.query_type();
            let name = query.name().to_string();

            let result = match record_type {
                RecordType::A => match self.state.resolve(&name) {
                    Some(ip) => {
                        debug!(query = %name, ip = %ip, "hijacked A query");
                        answers.push(Record::from_rdata(
                            Name::from(query.name().clone()),
                            self.ttl,
                            RData::A(A::from(ip)),
                        ));
                        QueryResult::Hijacked
                    }
                    None => {
                        debug!(query = %name, "no mapping for A query");
                        unanswered_a = true;
                        QueryResult::NxDomain
                    }
                },
                RecordType::AAAA => {
                    debug!(query = %name, "AAAA query, answering empty");
                    QueryResult::Empty
                }
                other => {
                    debug!(query = %name, record_type = %other, "unsupported query type");
                    QueryResult::Empty
                }
            };

            metrics::record_query(&record_type.to_string(), result, timer.elapsed());
        }

        let code = if answers.is_empty() && unanswered_a {
            ResponseCode::NXDomain
        } else {
            ResponseCode::NoError
        };

        (answers, code)
    }
}

#[async_trait]
impl RequestHandler for HijackHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let mut header = Header::response_from_request(request.header());

        let is_query = request.header().message_type() == MessageType::Query
            && request.header().op_code() == OpCode::Query;

        let (answers, code) = if is_query {
            self.answer(request)
        } else {
            debug!(
                src = %request.src(),
                op_code = ?request.header().op_code(),
                "rejecting non-query request"
            );
            metrics::record_query("none", QueryResult::Unsupported, std::time::Duration::ZERO);
            (Vec::new(), ResponseCode::NotImp)
        };

        header.set_response_code(code);
        header.set_authoritative(!answers.is_empty());

        let response = MessageResponseBuilder::from_message_request(request).build(
            header,
            answers.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );

        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "failed to send DNS response");
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}
