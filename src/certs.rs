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

//! Component 4.D: the on-demand certificate engine. A root CA is loaded
//! once from disk at startup; leaves are minted lazily per cache key
//! (wildcard-per-TLD by default, see DESIGN.md) and cached with a
//! bounded LRU, re-minted only once they expire.

use rand::RngCore;
use rcgen::{
	CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
	KeyUsagePurpose, SerialNumber,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tracing::{instrument, warn};

const LEAF_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CertError {
	#[error("reading {0}: {1}")]
	Read(std::path::PathBuf, #[source] std::io::Error),
	#[error("no PEM certificate found in {0}")]
	NoCertificate(std::path::PathBuf),
	#[error("no PEM private key found in {0}")]
	NoPrivateKey(std::path::PathBuf),
	#[error("parsing CA material: {0}")]
	Parse(#[from] rcgen::Error),
	#[error("deriving a signing key from a minted certificate")]
	SigningKey,
	#[error("SNI required")]
	SniRequired,
}

/// The loaded root CA, able to sign fresh leaf certificates.
pub struct CertificateAuthority {
	issuer: Issuer<'static, KeyPair>,
}

impl CertificateAuthority {
	pub fn load(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<Self, CertError> {
		let cert_pem = std::fs::read_to_string(cert_path)
			.map_err(|e| CertError::Read(cert_path.to_path_buf(), e))?;
		let key_pem =
			std::fs::read_to_string(key_path).map_err(|e| CertError::Read(key_path.to_path_buf(), e))?;
		let key_pair = KeyPair::from_pem(&key_pem)?;
		let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;
		Ok(Self { issuer })
	}

	/// Mints a leaf certificate for `key`, a SNI name or a `*.<tld>`
	/// wildcard. For a wildcard key the bare TLD is added as an
	/// additional SAN so the apex also validates.
	fn mint(&self, key: &str, bare_tld: Option<&str>) -> Result<CertifiedKeyDer, CertError> {
		let mut sans = vec![key.to_string()];
		if let Some(tld) = bare_tld {
			sans.push(tld.to_string());
		}
		let mut params = CertificateParams::new(sans)?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::OrganizationName, "paw-proxy");
		dn.push(DnType::CommonName, key);
		params.distinguished_name = dn;
		let now = OffsetDateTime::now_utc();
		params.not_before = now;
		params.not_after = now + time::Duration::seconds(LEAF_LIFETIME.as_secs() as i64);
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		let mut serial = [0u8; 16];
		rand::rng().fill_bytes(&mut serial);
		params.serial_number = Some(SerialNumber::from_slice(&serial));

		let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
		let cert = params.signed_by(&leaf_key, &self.issuer)?;
		Ok(CertifiedKeyDer {
			chain: vec![cert.der().clone()],
			key_der: leaf_key.serialize_der(),
			not_after: SystemTime::now() + LEAF_LIFETIME,
		})
	}
}

struct CertifiedKeyDer {
	chain: Vec<rustls::pki_types::CertificateDer<'static>>,
	key_der: Vec<u8>,
	not_after: SystemTime,
}

struct CacheEntry {
	certified: Arc<CertifiedKey>,
	not_after: SystemTime,
}

/// Bounded LRU of minted leaves, keyed by SNI name or wildcard string.
/// Eviction order is insertion order, tracked alongside the map.
pub struct CertCache {
	ca: CertificateAuthority,
	tld: String,
	wildcard: bool,
	cap: usize,
	entries: RwLock<HashMap<String, CacheEntry>>,
	order: RwLock<Vec<String>>,
}

impl CertCache {
	pub fn new(ca: CertificateAuthority, tld: impl Into<String>, cap: usize) -> Self {
		Self {
			ca,
			tld: tld.into(),
			wildcard: true,
			entries: RwLock::new(HashMap::new()),
			order: RwLock::new(Vec::new()),
			cap,
		}
	}

	/// Maps a concrete SNI ServerName to the cache key this policy uses:
	/// the wildcard `*.<tld>` for anything under the TLD, or the name
	/// itself otherwise (e.g. the bare TLD, or a future per-SNI policy).
	fn cache_key(&self, sni: &str) -> String {
		if self.wildcard && sni != self.tld && sni.ends_with(&format!(".{}", self.tld)) {
			format!("*.{}", self.tld)
		} else {
			sni.to_string()
		}
	}

	#[instrument(level = "info", skip(self), fields(cache_key = %self.cache_key(sni)))]
	fn get_or_mint(&self, sni: &str) -> Result<Arc<CertifiedKey>, CertError> {
		let key = self.cache_key(sni);
		let now = SystemTime::now();

		if let Some(entry) = self.entries.read().expect("cert cache lock is never poisoned").get(&key)
		{
			if now < entry.not_after {
				return Ok(entry.certified.clone());
			}
		}

		let mut entries = self.entries.write().expect("cert cache lock is never poisoned");
		if let Some(entry) = entries.get(&key) {
			if now < entry.not_after {
				return Ok(entry.certified.clone());
			}
			entries.remove(&key);
		}

		let bare_tld = (key == format!("*.{}", self.tld)).then_some(self.tld.as_str());
		let minted = self.ca.mint(&key, bare_tld)?;
		let signing_key = rustls::crypto::ring::sign::any_ecdsa_type(&rustls::pki_types::PrivateKeyDer::Pkcs8(
			minted.key_der.into(),
		))
		.map_err(|_| CertError::SigningKey)?;
		let certified = Arc::new(CertifiedKey::new(minted.chain, signing_key));

		let mut order = self.order.write().expect("cert cache lock is never poisoned");
		if entries.len() >= self.cap {
			if let Some(oldest) = (!order.is_empty()).then(|| order.remove(0)) {
				entries.remove(&oldest);
			}
		}
		order.push(key.clone());
		entries.insert(key, CacheEntry { certified: certified.clone(), not_after: minted.not_after });
		Ok(certified)
	}

	pub fn len(&self) -> usize {
		self.entries.read().expect("cert cache lock is never poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl std::fmt::Debug for CertCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertCache").field("tld", &self.tld).field("cap", &self.cap).finish()
	}
}

impl ResolvesServerCert for CertCache {
	fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
		let Some(sni) = client_hello.server_name() else {
			warn!(error = %CertError::SniRequired, "rejecting handshake with no SNI");
			return None;
		};
		match self.get_or_mint(sni) {
			Ok(key) => Some(key),
			Err(e) => {
				warn!(error = %e, sni, "failed to mint certificate");
				None
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_ca() -> CertificateAuthority {
		let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
		let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
		params.distinguished_name = {
			let mut dn = DistinguishedName::new();
			dn.push(DnType::CommonName, "paw-proxy test root");
			dn
		};
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Constrained(0));
		params.self_signed(&key_pair).unwrap();
		let issuer = Issuer::new(params, key_pair);
		CertificateAuthority { issuer }
	}

	#[test]
	fn wildcard_key_covers_every_subdomain() {
		let cache = CertCache::new(test_ca(), "test", 4);
		assert_eq!(cache.cache_key("myapp.test"), "*.test");
		assert_eq!(cache.cache_key("svc.proj.test"), "*.test");
		assert_eq!(cache.cache_key("test"), "test");
	}

	#[test]
	fn cache_fills_and_evicts_oldest() {
		let cache = CertCache { wildcard: false, ..CertCache::new(test_ca(), "test", 2) };
		cache.get_or_mint("a.test").unwrap();
		cache.get_or_mint("b.test").unwrap();
		assert_eq!(cache.len(), 2);
		cache.get_or_mint("c.test").unwrap();
		assert_eq!(cache.len(), 2);
		assert!(cache.entries.read().unwrap().contains_key("c.test"));
		assert!(!cache.entries.read().unwrap().contains_key("a.test"));
	}
}
