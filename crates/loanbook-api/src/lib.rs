use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use loanbook_core::{
    coerce_amount, now_rfc3339, validate_snapshot, ClientError, ClientId, ClientRecord,
    ClientSubmission, RestoreCandidate,
};
use loanbook_store_sqlite::{NewClient, SqliteStore};
pub use loanbook_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpsertClientRequest {
    pub name: String,
    pub loan: Value,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertStatus {
    Created,
    Updated,
}

impl UpsertStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpsertClientResult {
    pub status: UpsertStatus,
    pub client: ClientRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupReport {
    pub count: usize,
    pub file: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreSummary {
    pub inserted: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct LoanbookApi {
    db_path: PathBuf,
    backup_path: PathBuf,
}

impl LoanbookApi {
    #[must_use]
    pub fn new(db_path: PathBuf, backup_path: PathBuf) -> Self {
        Self { db_path, backup_path }
    }

    #[must_use]
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    fn open_store(&self) -> Result<SqliteStore, ClientError> {
        let mut store = SqliteStore::open(&self.db_path).map_err(store_error)?;
        store.migrate().map_err(store_error)?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns [`ClientError::Store`] when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, ClientError> {
        let store = SqliteStore::open(&self.db_path).map_err(store_error)?;
        store.schema_status().map_err(store_error)
    }

    /// Apply pending migrations.
    ///
    /// # Errors
    /// Returns [`ClientError::Store`] when migration fails.
    pub fn migrate(&self) -> Result<SchemaStatus, ClientError> {
        let store = self.open_store()?;
        store.schema_status().map_err(store_error)
    }

    /// Create-or-update one client, matched by `name` alone.
    ///
    /// A name match overwrites `loan`, `email`, and `phone` in place and
    /// preserves `created_at` and the accumulated `repaid`; otherwise a new
    /// record is inserted with `repaid = 0` and a fresh timestamp. By-name
    /// matching deliberately differs from the restore reconciler's
    /// natural-key rule: a second submission for a name is always an edit.
    ///
    /// # Errors
    /// Returns [`ClientError::Validation`] for a blank name or non-numeric
    /// loan (store untouched), or [`ClientError::Store`] on persistence failure.
    pub fn upsert_client(
        &self,
        request: UpsertClientRequest,
    ) -> Result<UpsertClientResult, ClientError> {
        let submission =
            ClientSubmission::new(request.name, &request.loan, request.email, request.phone)?;
        let mut store = self.open_store()?;

        if let Some(existing) = store.find_by_name(&submission.name).map_err(store_error)? {
            store
                .update_client_fields(
                    existing.id,
                    &submission.name,
                    submission.loan,
                    submission.email.as_deref(),
                    submission.phone.as_deref(),
                )
                .map_err(store_error)?;
            let client = fetch_client(&store, existing.id)?;
            return Ok(UpsertClientResult { status: UpsertStatus::Updated, client });
        }

        let id = store
            .insert_client(&NewClient {
                name: submission.name,
                loan: submission.loan,
                repaid: 0.0,
                created_at: now_rfc3339()?,
                email: submission.email,
                phone: submission.phone,
            })
            .map_err(store_error)?;
        let client = fetch_client(&store, id)?;
        Ok(UpsertClientResult { status: UpsertStatus::Created, client })
    }

    /// Apply a signed repayment delta to one client.
    ///
    /// # Errors
    /// Returns [`ClientError::Validation`] for a non-numeric amount,
    /// [`ClientError::NotFound`] when no row has this id, or
    /// [`ClientError::Store`] on persistence failure.
    pub fn apply_repayment(&self, id: i64, amount: &Value) -> Result<ClientRecord, ClientError> {
        let delta = coerce_amount(amount).ok_or_else(|| {
            ClientError::Validation("repaid amount MUST be numeric".to_string())
        })?;

        let mut store = self.open_store()?;
        let affected = store.add_repayment(ClientId(id), delta).map_err(store_error)?;
        if affected == 0 {
            return Err(ClientError::NotFound(format!("no client with id {id}")));
        }
        fetch_client(&store, ClientId(id))
    }

    /// Overwrite `name`, `loan`, `email`, `phone` for the row with this id.
    ///
    /// # Errors
    /// Returns [`ClientError::Validation`] for malformed fields,
    /// [`ClientError::NotFound`] when no row has this id, or
    /// [`ClientError::Store`] on persistence failure.
    pub fn update_client(
        &self,
        id: i64,
        request: UpsertClientRequest,
    ) -> Result<ClientRecord, ClientError> {
        let submission =
            ClientSubmission::new(request.name, &request.loan, request.email, request.phone)?;
        let mut store = self.open_store()?;

        let affected = store
            .update_client_fields(
                ClientId(id),
                &submission.name,
                submission.loan,
                submission.email.as_deref(),
                submission.phone.as_deref(),
            )
            .map_err(store_error)?;
        if affected == 0 {
            return Err(ClientError::NotFound(format!("no client with id {id}")));
        }
        fetch_client(&store, ClientId(id))
    }

    /// Delete one client by id.
    ///
    /// # Errors
    /// Returns [`ClientError::NotFound`] when no row has this id, or
    /// [`ClientError::Store`] on persistence failure.
    pub fn delete_client(&self, id: i64) -> Result<(), ClientError> {
        let mut store = self.open_store()?;
        let affected = store.delete_client(ClientId(id)).map_err(store_error)?;
        if affected == 0 {
            return Err(ClientError::NotFound(format!("no client with id {id}")));
        }
        Ok(())
    }

    /// List every client record in store iteration order.
    ///
    /// # Errors
    /// Returns [`ClientError::Store`] when the listing fails.
    pub fn list_clients(&self) -> Result<Vec<ClientRecord>, ClientError> {
        let store = self.open_store()?;
        store.list_clients().map_err(store_error)
    }

    /// Snapshot every record to the configured backup file, overwriting any
    /// prior snapshot. Pure export: the store is never mutated.
    ///
    /// # Errors
    /// Returns [`ClientError::Store`] when reading the store or writing the
    /// snapshot file fails.
    pub fn export_backup(&self) -> Result<BackupReport, ClientError> {
        let store = self.open_store()?;
        let records = store.list_clients().map_err(store_error)?;

        let body = serde_json::to_vec_pretty(&records).map_err(|err| {
            ClientError::Store(format!("failed to serialize backup snapshot: {err}"))
        })?;
        fs::write(&self.backup_path, &body).map_err(|err| {
            ClientError::Store(format!(
                "failed to write backup snapshot {}: {err}",
                self.backup_path.display()
            ))
        })?;

        Ok(BackupReport {
            count: records.len(),
            file: self.backup_path.display().to_string(),
            sha256: sha256_hex(&body),
        })
    }

    /// Restore from the configured backup file.
    ///
    /// # Errors
    /// Returns [`ClientError::NotFound`] when no snapshot exists,
    /// [`ClientError::Validation`] when the snapshot fails the batch gate, or
    /// [`ClientError::Store`] on read/persistence failure.
    pub fn restore_from_backup(&self) -> Result<RestoreSummary, ClientError> {
        let bytes = fs::read(&self.backup_path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ClientError::NotFound(format!(
                    "backup snapshot not found at {}",
                    self.backup_path.display()
                ))
            } else {
                ClientError::Store(format!(
                    "failed to read backup snapshot {}: {err}",
                    self.backup_path.display()
                ))
            }
        })?;
        self.restore_bytes(&bytes)
    }

    /// Restore from a snapshot file that the caller keeps.
    ///
    /// # Errors
    /// Returns [`ClientError::NotFound`] when the file does not exist,
    /// [`ClientError::Validation`] when the payload fails the batch gate, or
    /// [`ClientError::Store`] on read/persistence failure.
    pub fn restore_from_file(&self, snapshot: &Path) -> Result<RestoreSummary, ClientError> {
        let bytes = fs::read(snapshot).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ClientError::NotFound(format!("snapshot not found at {}", snapshot.display()))
            } else {
                ClientError::Store(format!(
                    "failed to read snapshot {}: {err}",
                    snapshot.display()
                ))
            }
        })?;
        self.restore_bytes(&bytes)
    }

    /// Restore from an uploaded snapshot file, deleting it after reading.
    ///
    /// The ephemeral file is removed whether or not reconciliation succeeds.
    ///
    /// # Errors
    /// Returns [`ClientError::Validation`] when the payload fails the batch
    /// gate, or [`ClientError::Store`] on read/persistence failure.
    pub fn restore_from_upload(&self, upload: &Path) -> Result<RestoreSummary, ClientError> {
        let read_result = fs::read(upload);
        let _ = fs::remove_file(upload);

        let bytes = read_result.map_err(|err| {
            ClientError::Store(format!(
                "failed to read uploaded snapshot {}: {err}",
                upload.display()
            ))
        })?;
        self.restore_bytes(&bytes)
    }

    fn restore_bytes(&self, bytes: &[u8]) -> Result<RestoreSummary, ClientError> {
        let payload: Value = serde_json::from_slice(bytes).map_err(|err| {
            ClientError::Validation(format!("backup payload is not valid JSON: {err}"))
        })?;
        let candidates = validate_snapshot(&payload)?;

        let mut store = self.open_store()?;
        let default_created_at = now_rfc3339()?;
        reconcile_candidates(&mut store, &candidates, &default_created_at)
    }
}

/// Merge validated candidates into the store, sequentially and in input order.
///
/// Each candidate's natural key is `(name, created_at)`, substituting
/// `default_created_at` when the candidate carries no timestamp. The default
/// is computed once per batch, so two timestamp-less candidates sharing a
/// name resolve to the same key and the second one is skipped. A natural-key
/// match skips the candidate; otherwise it is inserted with a fresh surrogate
/// id. A store-level insert failure is absorbed into the `failed` counter and
/// never aborts the batch, which keeps re-running a restore safe.
///
/// # Errors
/// Returns [`ClientError::Store`] when a natural-key lookup fails; insert
/// failures are counted, not returned.
pub fn reconcile_candidates(
    store: &mut SqliteStore,
    candidates: &[RestoreCandidate],
    default_created_at: &str,
) -> Result<RestoreSummary, ClientError> {
    let mut summary = RestoreSummary::default();

    for candidate in candidates {
        let created_at = candidate
            .created_at
            .clone()
            .unwrap_or_else(|| default_created_at.to_string());

        if store
            .find_by_natural_key(&candidate.name, &created_at)
            .map_err(store_error)?
            .is_some()
        {
            summary.skipped += 1;
            continue;
        }

        let insert = store.insert_client(&NewClient {
            name: candidate.name.clone(),
            loan: candidate.loan,
            repaid: candidate.repaid,
            created_at,
            email: candidate.email.clone(),
            phone: candidate.phone.clone(),
        });
        match insert {
            Ok(_) => summary.inserted += 1,
            Err(_) => summary.failed += 1,
        }
    }

    Ok(summary)
}

fn fetch_client(store: &SqliteStore, id: ClientId) -> Result<ClientRecord, ClientError> {
    store
        .get_client(id)
        .map_err(store_error)?
        .ok_or_else(|| ClientError::Store(format!("client row {id} vanished after write")))
}

fn store_error(err: anyhow::Error) -> ClientError {
    ClientError::Store(format!("{err:#}"))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}
