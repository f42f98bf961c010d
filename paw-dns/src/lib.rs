// Copyright Paw Proxy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Component 4.E: a local DNS responder that answers A/AAAA for exactly one
//! configured TLD with loopback addresses. It never consults the route
//! registry — any name under the TLD resolves, whether or not a route is
//! actually registered; the HTTP layer is the one that tells an unregistered
//! name apart from a registered one.

use hickory_proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_server::ServerFuture;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Answer TTL, kept short so renamed/expired routes don't linger in
/// resolver caches.
const ANSWER_TTL: u32 = 60;

#[derive(thiserror::Error, Debug)]
pub enum DnsError {
	#[error("invalid tld {0:?}")]
	InvalidTld(String),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Answers A/AAAA for `<anything>.<tld>` and the bare `<tld>` with loopback
/// addresses; every other query gets an authoritative empty answer.
#[derive(Clone)]
pub struct TldResponder {
	tld: Name,
}

impl TldResponder {
	pub fn new(tld: &str) -> Result<Self, DnsError> {
		let name =
			Name::from_ascii(format!("{tld}.")).map_err(|_| DnsError::InvalidTld(tld.to_string()))?;
		Ok(Self { tld: name.to_lowercase() })
	}

	fn owns(&self, name: &Name) -> bool {
		let name = name.to_lowercase();
		name == self.tld || self.tld.zone_of(&name)
	}
}

#[async_trait::async_trait]
impl RequestHandler for TldResponder {
	async fn handle_request<R: ResponseHandler>(
		&self,
		request: &Request,
		mut response_handle: R,
	) -> ResponseInfo {
		let query = request.query();
		let name: Name = Name::from(query.name().clone());
		let name = &name;
		let mut header = Header::response_from_request(request.header());
		header.set_message_type(MessageType::Response);
		header.set_authoritative(true);

		let builder = MessageResponseBuilder::from_message_request(request);
		let fail = |mut header: Header| {
			header.set_response_code(ResponseCode::ServFail);
			ResponseInfo::from(header)
		};

		if request.op_code() != OpCode::Query || !self.owns(name) {
			header.set_response_code(ResponseCode::Refused);
			let response = builder.build_no_records(header);
			return response_handle
				.send_response(response)
				.await
				.unwrap_or_else(|e| {
					warn!(error = %e, "failed to send dns refusal");
					fail(Header::new())
				});
		}

		let records: Vec<Record> = match query.query_type() {
			RecordType::A => vec![Record::from_rdata(
				name.clone(),
				ANSWER_TTL,
				RData::A(A(Ipv4Addr::LOCALHOST)),
			)],
			RecordType::AAAA => vec![Record::from_rdata(
				name.clone(),
				ANSWER_TTL,
				RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
			)],
			_ => Vec::new(),
		};
		header.set_response_code(ResponseCode::NoError);

		let response = builder.build(header, records.iter(), [], [], []);
		response_handle
			.send_response(response)
			.await
			.unwrap_or_else(|e| {
				warn!(error = %e, "failed to send dns response");
				fail(Header::new())
			})
	}
}

/// Binds a UDP (and, best-effort, TCP) socket on loopback and serves `tld`
/// until `shutdown` resolves.
pub async fn serve(
	addr: SocketAddr,
	tld: &str,
	shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), DnsError> {
	let responder = TldResponder::new(tld)?;
	let mut server = ServerFuture::new(responder);

	let udp = UdpSocket::bind(addr).await?;
	info!(%addr, tld, "dns responder listening (udp)");
	server.register_socket(udp);

	if let Ok(tcp) = tokio::net::TcpListener::bind(addr).await {
		server.register_listener(tcp, Duration::from_secs(5));
	} else {
		debug!(%addr, "dns tcp listener unavailable, udp only");
	}

	tokio::select! {
		result = server.block_until_done() => {
			result.map_err(|e| DnsError::Io(std::io::Error::other(e)))
		}
		_ = shutdown => {
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn owns_bare_and_subdomain() {
		let r = TldResponder::new("test").unwrap();
		assert!(r.owns(&Name::from_ascii("test.").unwrap()));
		assert!(r.owns(&Name::from_ascii("myapp.test.").unwrap()));
		assert!(r.owns(&Name::from_ascii("svc.proj.test.").unwrap()));
		assert!(!r.owns(&Name::from_ascii("example.com.").unwrap()));
	}
}
