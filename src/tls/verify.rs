//! Certificate chain cleaning and hostname verification.

use tracing::debug;

use super::{Handshake, HostnameVerifier, PeerCertificate, TrustStore};
use crate::error::Error;

/// Chains longer than this are rejected outright. Real chains are three or
/// four certificates; anything deeper is a misconfigured peer or an attack.
const MAX_CHAIN_LENGTH: usize = 9;

/// Rebuilds a clean, ordered chain from whatever the peer presented.
///
/// Peers routinely send chains with extra, misordered, or missing
/// certificates. Starting at the leaf, each step looks up the next issuer,
/// first among the presented certificates and then in the trust store,
/// until a trusted or self-issued root terminates the chain.
pub struct CertificateChainCleaner {
    trust: Box<dyn TrustStore>,
}

impl std::fmt::Debug for CertificateChainCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateChainCleaner").finish()
    }
}

impl CertificateChainCleaner {
    pub fn new(trust: Box<dyn TrustStore>) -> CertificateChainCleaner {
        CertificateChainCleaner { trust }
    }

    pub fn clean(&self, chain: &[PeerCertificate]) -> Result<Vec<PeerCertificate>, Error> {
        let leaf = match chain.first() {
            Some(leaf) => leaf.clone(),
            None => return Err(Error::new_tls_untrusted()),
        };

        let mut pool: Vec<PeerCertificate> = chain[1..].to_vec();
        let mut result = vec![leaf];
        let mut trusted = false;

        for _ in 0..MAX_CHAIN_LENGTH {
            let current = result.last().unwrap();

            if let Some(issuer) = self.trust.find_issuer(current) {
                // The issuer may equal the current cert (a trusted
                // self-issued root already at the end of the chain).
                if issuer != *current {
                    result.push(issuer);
                }
                trusted = true;
                break;
            }

            if current.is_self_issued() && result.len() > 1 {
                // An untrusted self-issued tail is dropped rather than
                // treated as an error; the trust decision already failed.
                break;
            }

            // Search the peer-presented pool for the issuer.
            match pool.iter().position(|c| c.subject() == current.issuer()) {
                Some(i) => {
                    let issuer = pool.remove(i);
                    if result.iter().any(|c| *c == issuer) {
                        debug!("certificate chain loops at {:?}", issuer.subject());
                        return Err(Error::new_tls_untrusted());
                    }
                    result.push(issuer);
                }
                None => break,
            }
        }

        if result.len() > MAX_CHAIN_LENGTH {
            return Err(Error::new_tls_untrusted());
        }
        if trusted {
            Ok(result)
        } else {
            Err(Error::new_tls_untrusted())
        }
    }
}

/// The default [`HostnameVerifier`]: RFC 6125 matching of the requested
/// host against the leaf certificate's DNS subject-alternative-names.
#[derive(Debug, Default)]
pub struct StrictHostnameVerifier;

impl HostnameVerifier for StrictHostnameVerifier {
    fn verify(&self, host: &str, handshake: &Handshake) -> bool {
        match handshake.leaf() {
            Some(leaf) => verify_hostname(host, leaf),
            None => false,
        }
    }
}

/// Returns true if `host` is covered by one of `cert`'s DNS SANs.
pub fn verify_hostname(host: &str, cert: &PeerCertificate) -> bool {
    let host = canonicalize(host);
    cert.dns_sans()
        .iter()
        .any(|pattern| matches_pattern(&host, &canonicalize(pattern)))
}

fn canonicalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// RFC 6125 §6.4.3: at most one wildcard, only as the complete leftmost
/// label, matching exactly one label that contains no dot. A wildcard whose
/// remainder is a single label (`*.com`) never matches; that shape can only
/// cover a public suffix.
fn matches_pattern(host: &str, pattern: &str) -> bool {
    if host.is_empty() || pattern.is_empty() {
        return false;
    }

    if !pattern.contains('*') {
        return host == pattern;
    }

    if !pattern.starts_with("*.") || pattern["*.".len()..].contains('*') {
        return false;
    }

    let suffix = &pattern[1..]; // ".example.test"
    if !suffix[1..].contains('.') {
        // `*.tld` would match every registrable domain under the suffix.
        return false;
    }

    if !host.ends_with(suffix) {
        return false;
    }

    let label = &host[..host.len() - suffix.len()];
    !label.is_empty() && !label.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn cert(subject: &str, issuer: &str, sans: &[&str]) -> PeerCertificate {
        PeerCertificate::new(
            Bytes::from(format!("der:{}", subject)),
            subject,
            issuer,
            sans.iter().map(|s| s.to_string()).collect(),
        )
    }

    struct Roots(Vec<PeerCertificate>);

    impl TrustStore for Roots {
        fn find_issuer(&self, c: &PeerCertificate) -> Option<PeerCertificate> {
            self.0
                .iter()
                .find(|root| root.subject() == c.issuer())
                .cloned()
        }
    }

    #[test]
    fn exact_match() {
        let c = cert("cn=a", "cn=ca", &["a.example.test"]);
        assert!(verify_hostname("a.example.test", &c));
        assert!(verify_hostname("A.EXAMPLE.TEST.", &c));
        assert!(!verify_hostname("b.example.test", &c));
    }

    #[test]
    fn wildcard_matches_one_label() {
        let c = cert("cn=a", "cn=ca", &["*.example.test"]);
        assert!(verify_hostname("a.example.test", &c));
        assert!(verify_hostname("b.example.test", &c));
        assert!(!verify_hostname("example.test", &c));
        assert!(!verify_hostname("a.b.example.test", &c));
    }

    #[test]
    fn wildcard_never_covers_a_suffix() {
        let c = cert("cn=a", "cn=ca", &["*.test"]);
        assert!(!verify_hostname("example.test", &c));
    }

    #[test]
    fn wildcard_only_leftmost() {
        let c = cert("cn=a", "cn=ca", &["a.*.example.test", "f*o.example.test"]);
        assert!(!verify_hostname("a.b.example.test", &c));
        assert!(!verify_hostname("foo.example.test", &c));
    }

    #[test]
    fn cleaner_orders_and_roots_chain() {
        let root = cert("cn=root", "cn=root", &[]);
        let inter = cert("cn=inter", "cn=root", &[]);
        let leaf = cert("cn=leaf", "cn=inter", &["x.example.test"]);

        let cleaner = CertificateChainCleaner::new(Box::new(Roots(vec![root.clone()])));
        // Presented misordered, with the root included.
        let cleaned = cleaner
            .clean(&[leaf.clone(), root.clone(), inter.clone()])
            .unwrap();
        assert_eq!(
            cleaned.iter().map(|c| c.subject()).collect::<Vec<_>>(),
            vec!["cn=leaf", "cn=inter", "cn=root"]
        );
    }

    #[test]
    fn cleaner_rejects_untrusted() {
        let leaf = cert("cn=leaf", "cn=nobody", &[]);
        let cleaner = CertificateChainCleaner::new(Box::new(Roots(vec![])));
        assert!(cleaner.clean(&[leaf]).unwrap_err().is_tls());
    }

    #[test]
    fn cleaner_rejects_loops() {
        let a = cert("cn=a", "cn=b", &[]);
        let b = cert("cn=b", "cn=a", &[]);
        let cleaner = CertificateChainCleaner::new(Box::new(Roots(vec![])));
        assert!(cleaner
            .clean(&[a.clone(), b.clone(), a.clone()])
            .unwrap_err()
            .is_tls());
    }
}
