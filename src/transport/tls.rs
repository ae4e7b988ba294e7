use std::io::Cursor;
use std::sync::Arc;

use a2a_wire::A2aError;
use once_cell::sync::Lazy;
use rustls::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use crate::config::TlsSettings;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(CryptoProvider {
		cipher_suites: vec![
			rustls::crypto::ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
			rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
			rustls::crypto::ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
			rustls::crypto::ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
		],
		..rustls::crypto::ring::default_provider()
	})
}

static SYSTEM_ROOT: Lazy<rustls_native_certs::CertificateResult> =
	Lazy::new(rustls_native_certs::load_native_certs);

fn parse_cert(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, A2aError> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	rustls_pemfile::certs(&mut reader)
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| A2aError::protocol(format!("invalid certificate pem: {e}")))
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, A2aError> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	rustls_pemfile::private_key(&mut reader)
		.map_err(|e| A2aError::protocol(format!("invalid private key pem: {e}")))?
		.ok_or_else(|| A2aError::protocol("no private key found in pem"))
}

/// Build a rustls client config from the peer's TLS material. `alpn_h2` forces
/// HTTP/2 negotiation for the h2-based protocols.
pub(crate) fn client_config(
	tls: &TlsSettings,
	alpn_h2: bool,
) -> Result<Arc<ClientConfig>, A2aError> {
	let mut roots = rustls::RootCertStore::empty();
	if let Some(ca) = &tls.ca {
		let pem = std::fs::read(ca)
			.map_err(|e| A2aError::protocol(format!("reading CA bundle {}: {e}", ca.display())))?;
		let certs = parse_cert(&pem)?;
		roots.add_parsable_certificates(certs);
	} else {
		for cert in &SYSTEM_ROOT.certs {
			let _ = roots.add(cert.clone());
		}
	}

	let builder = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)
		.map_err(|e| A2aError::protocol(format!("tls config: {e}")))?
		.with_root_certificates(roots);

	let mut config = match (&tls.cert, &tls.key) {
		(Some(cert), Some(key)) => {
			let cert_chain = parse_cert(&std::fs::read(cert).map_err(|e| {
				A2aError::protocol(format!("reading client cert {}: {e}", cert.display()))
			})?)?;
			let private_key = parse_key(&std::fs::read(key).map_err(|e| {
				A2aError::protocol(format!("reading client key {}: {e}", key.display()))
			})?)?;
			builder
				.with_client_auth_cert(cert_chain, private_key)
				.map_err(|e| A2aError::protocol(format!("client auth: {e}")))?
		},
		_ => builder.with_no_client_auth(),
	};

	if !tls.verify {
		config
			.dangerous()
			.set_certificate_verifier(Arc::new(insecure::NoVerifier));
	}
	if alpn_h2 {
		config.alpn_protocols = vec![b"h2".into()];
	}
	Ok(Arc::new(config))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, A2aError> {
	ServerName::try_from(host.to_string())
		.map_err(|e| A2aError::protocol(format!("invalid tls server name {host:?}: {e}")))
}

pub mod insecure {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::{DigitallySignedStruct, SignatureScheme};

	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer,
			_intermediates: &[CertificateDer],
			_server_name: &ServerName,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
				SignatureScheme::ECDSA_NISTP521_SHA512,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
			]
		}
	}
}
