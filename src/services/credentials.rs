use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// A backend credential. Debug output is redacted so it cannot leak through
/// logs or error chains.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Stable fingerprint safe to persist alongside the job.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Where a job's credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    PerRequest,
    Default,
}

/// Process-local handoff of per-request credentials from the API to the
/// worker. The worker takes an entry exactly once, when it claims the job;
/// nothing else reads or removes entries.
#[derive(Debug, Default)]
pub struct CredentialVault {
    entries: DashMap<Uuid, Credential>,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the secret for a job that has not been claimed yet.
    /// A second deposit for the same job replaces the first.
    pub fn deposit(&self, job_id: Uuid, credential: Credential) {
        self.entries.insert(job_id, credential);
    }

    /// Remove and return the job's secret.
    pub fn take(&self, job_id: Uuid) -> Option<Credential> {
        self.entries.remove(&job_id).map(|(_, credential)| credential)
    }

    /// Drop a deposit whose job never made it into the store.
    pub fn discard(&self, job_id: Uuid) {
        self.entries.remove(&job_id);
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.entries.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Credential owned by one job while it is being processed.
///
/// Created by claiming the vault entry, so the vault no longer holds it; the
/// secret is dropped with this value on every exit path, panics included.
#[derive(Debug)]
pub struct JobCredential {
    job_id: Uuid,
    credential: Option<Credential>,
    source: CredentialSource,
}

impl JobCredential {
    /// Claim the job's per-request secret, falling back to the process default.
    pub fn claim(vault: &CredentialVault, job_id: Uuid, default: Option<&Credential>) -> Self {
        match vault.take(job_id) {
            Some(credential) => Self {
                job_id,
                credential: Some(credential),
                source: CredentialSource::PerRequest,
            },
            None => Self {
                job_id,
                credential: default.cloned(),
                source: CredentialSource::Default,
            },
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }
}

impl Drop for JobCredential {
    fn drop(&mut self) {
        if self.credential.take().is_some() {
            tracing::debug!(job_id = %self.job_id, "Job credential released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_removes_vault_entry() {
        let vault = CredentialVault::new();
        let job_id = Uuid::new_v4();
        vault.deposit(job_id, Credential::new("per-request-secret"));

        let claimed = JobCredential::claim(&vault, job_id, None);
        assert_eq!(claimed.source(), CredentialSource::PerRequest);
        assert_eq!(claimed.credential().unwrap().expose(), "per-request-secret");
        assert!(!vault.contains(job_id));
        assert!(vault.is_empty());
    }

    #[test]
    fn test_missing_entry_falls_back_to_default() {
        let vault = CredentialVault::new();
        let default = Credential::new("env-secret");
        let claimed = JobCredential::claim(&vault, Uuid::new_v4(), Some(&default));
        assert_eq!(claimed.source(), CredentialSource::Default);
        assert_eq!(claimed.credential(), Some(&default));

        let none = JobCredential::claim(&vault, Uuid::new_v4(), None);
        assert!(none.credential().is_none());
    }

    #[test]
    fn test_redeposit_keeps_single_entry() {
        let vault = CredentialVault::new();
        let job_id = Uuid::new_v4();
        vault.deposit(job_id, Credential::new("first"));
        vault.deposit(job_id, Credential::new("second"));
        assert_eq!(vault.len(), 1);
        assert_eq!(vault.take(job_id).unwrap().expose(), "second");
        assert!(vault.take(job_id).is_none());
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let credential = Credential::new("super-secret-value");
        assert!(!format!("{:?}", credential).contains("super-secret"));
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let fingerprint = Credential::new("abc").fingerprint();
        assert_eq!(
            fingerprint,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
