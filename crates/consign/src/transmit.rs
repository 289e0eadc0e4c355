//! Send a batch manifest and commit its entries.
//!
//! The relay call and the store commit are the two halves of a send. The
//! store is only touched after the relay accepted the message, and then in a
//! single write, so a failed send leaves every entry in `draft` for the next
//! attempt. A crash between the two halves resends the same manifest next
//! time; references are never reallocated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use consign_config::CarrierAccount;
use consign_mail::{Attachment, MailMessage, MailRelay, relay_from_config};
use consign_state::{Batch, EntryStore};
use consign_types::TransmissionReceipt;

use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestTemplate, attachment_name};

/// What a transmission did.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmitResult {
    pub batch_id: String,
    /// Entries moved to `done`, in batch order
    pub done_entries: Vec<String>,
    pub recipients: Vec<String>,
    /// Attachment filename; `None` when there was nothing to send
    pub attachment: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub shipments: Vec<String>,
    pub tracking_refs: Vec<String>,
}

impl TransmitResult {
    fn nothing_to_send(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            done_entries: Vec::new(),
            recipients: Vec::new(),
            attachment: None,
            sent_at: None,
            shipments: Vec::new(),
            tracking_refs: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.done_entries.is_empty()
    }

    pub fn receipt(&self, account: &str) -> Option<TransmissionReceipt> {
        let (Some(attachment), Some(sent_at)) = (&self.attachment, self.sent_at) else {
            return None;
        };
        Some(TransmissionReceipt {
            batch_id: self.batch_id.clone(),
            account: account.to_string(),
            sent_at,
            recipients: self.recipients.clone(),
            attachment: attachment.clone(),
            shipments: self.shipments.clone(),
            tracking_refs: self.tracking_refs.clone(),
        })
    }
}

pub struct ManifestTransmitter<'a> {
    account: &'a CarrierAccount,
    template: Arc<dyn ManifestTemplate>,
    relay: Option<Box<dyn MailRelay>>,
}

impl<'a> ManifestTransmitter<'a> {
    pub fn new(
        account: &'a CarrierAccount,
        template: Arc<dyn ManifestTemplate>,
        relay: Option<Box<dyn MailRelay>>,
    ) -> Self {
        Self {
            account,
            template,
            relay,
        }
    }

    /// Transmitter using the relay configured on the account, if any.
    pub fn from_account(
        account: &'a CarrierAccount,
        template: Arc<dyn ManifestTemplate>,
    ) -> Result<Self> {
        let relay = account
            .relay()
            .map(relay_from_config)
            .transpose()
            .map_err(|e| Error::Configuration(format!("{e:#}")))?;
        Ok(Self::new(account, template, relay))
    }

    pub fn relay_description(&self) -> Option<String> {
        self.relay.as_ref().map(|r| r.describe())
    }

    /// Fails when the account cannot send manifests at all.
    pub fn ensure_ready(&self) -> Result<&dyn MailRelay> {
        let account = self.account;
        if !account.is_offline() {
            return Err(Error::Configuration(format!(
                "account '{}' is not configured for offline sending",
                account.name()
            )));
        }
        match &self.relay {
            Some(relay) => Ok(relay.as_ref()),
            None => Err(Error::Configuration(format!(
                "account '{}' has no mail relay configured",
                account.name()
            ))),
        }
    }

    /// Send `batch` and mark its entries done in `store`.
    ///
    /// An empty batch is a no-op. Relay failures surface as
    /// [`Error::Transmission`] with the store untouched.
    pub fn transmit(&self, batch: &Batch, store: &dyn EntryStore) -> Result<TransmitResult> {
        let account = self.account;
        let relay = self.ensure_ready()?;
        if batch.account != account.name() {
            return Err(Error::InvalidInput(format!(
                "batch belongs to account '{}', not '{}'",
                batch.account,
                account.name()
            )));
        }
        if batch.is_empty() {
            return Ok(TransmitResult::nothing_to_send(batch));
        }

        let sent_at = Utc::now();
        let manifest = Manifest::build(account, batch, sent_at);
        let bytes = self
            .template
            .render(&manifest)
            .map_err(|e| Error::Manifest(format!("{e:#}")))?;
        let filename = attachment_name(account, &manifest, self.template.as_ref());

        let message = MailMessage {
            from: account.sender_email().to_string(),
            to: account.recipients(),
            subject: format!(
                "{} manifest {} ({} shipments, {} packages)",
                account.filename_prefix(),
                manifest.batch_id,
                manifest.shipments.len(),
                manifest.package_count()
            ),
            body: message_body(&manifest),
            attachment: Attachment::new(&filename, self.template.content_type(), bytes),
        };

        relay
            .send(&message)
            .map_err(|e| Error::Transmission(format!("{}: {e:#}", relay.describe())))?;

        let ids = batch.entry_ids();
        store
            .commit_done(account.name(), &ids)
            .map_err(Error::storage)?;

        Ok(TransmitResult {
            batch_id: batch.batch_id.clone(),
            done_entries: ids,
            recipients: message.to,
            attachment: Some(filename),
            sent_at: Some(sent_at),
            shipments: batch.entries.iter().map(|e| e.shipment.clone()).collect(),
            tracking_refs: batch
                .entries
                .iter()
                .map(|e| e.vals.tracking_ref.clone())
                .collect(),
        })
    }
}

fn message_body(manifest: &Manifest) -> String {
    let mut body = format!(
        "Account: {}\nCustomer code: {}\nBatch: {}\n\n",
        manifest.account, manifest.ci, manifest.batch_id
    );
    for shipment in &manifest.shipments {
        body.push_str(&format!("{}\t{}\n", shipment.shipment, shipment.vals.tracking_ref));
    }
    body
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use consign_mail::{RelayConfig, SpoolRelay};
    use consign_sequence::MemorySequence;
    use consign_state::MemoryEntryStore;
    use consign_types::EntryState;
    use tempfile::tempdir;

    use super::*;
    use crate::assemble::BatchAssembler;
    use crate::assemble::tests::{account, shipment};
    use crate::manifest::JsonManifestTemplate;

    /// Relay that records messages and can be told to fail.
    #[derive(Default)]
    pub(crate) struct RecordingRelay {
        pub(crate) sent: Arc<Mutex<Vec<MailMessage>>>,
        pub(crate) fail: bool,
    }

    impl MailRelay for RecordingRelay {
        fn send(&self, message: &MailMessage) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            self.sent.lock().expect("lock").push(message.clone());
            Ok(())
        }

        fn describe(&self) -> String {
            "recording relay".to_string()
        }
    }

    fn queued(store: &MemoryEntryStore, account: &CarrierAccount) -> Batch {
        let counter = MemorySequence::new();
        let plan = BatchAssembler::new(account, &counter)
            .assemble(&[shipment("OUT/1", 2), shipment("OUT/2", 1)])
            .expect("assemble");
        store.append(&plan.entries).expect("append");
        store.draft_batch(account.name()).expect("batch")
    }

    #[test]
    fn success_sends_once_and_commits_every_entry() {
        let account = account();
        let store = MemoryEntryStore::new();
        let batch = queued(&store, &account);
        let relay = RecordingRelay::default();
        let sent = Arc::clone(&relay.sent);

        let transmitter =
            ManifestTransmitter::new(&account, Arc::new(JsonManifestTemplate), Some(Box::new(relay)));
        let result = transmitter.transmit(&batch, &store).expect("transmit");

        assert_eq!(result.done_entries, batch.entry_ids());
        assert_eq!(
            result.recipients,
            vec!["manifests@carrier.example", "backup@carrier.example"]
        );
        assert_eq!(result.tracking_refs, vec!["4900001,4900002", "4900003"]);
        assert!(store.entries().expect("entries").iter().all(|e| e.state == EntryState::Done));

        let sent = sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        let message = &sent[0];
        assert_eq!(message.from, "dispatch@warehouse.example");
        assert_eq!(message.attachment.content_type, "application/json");
        assert!(message.attachment.filename.starts_with("SEUR-"));
        assert!(message.subject.contains("(2 shipments, 3 packages)"));
        assert!(message.body.contains("OUT/1\t4900001,4900002"));

        let manifest: Manifest =
            serde_json::from_slice(&message.attachment.bytes).expect("manifest");
        assert_eq!(manifest.batch_id, batch.batch_id);
        assert_eq!(manifest.shipments.len(), 2);

        let receipt = result.receipt(account.name()).expect("receipt");
        assert_eq!(receipt.shipments, vec!["OUT/1", "OUT/2"]);
    }

    #[test]
    fn relay_failure_leaves_entries_draft() {
        let account = account();
        let store = MemoryEntryStore::new();
        let batch = queued(&store, &account);
        let relay = RecordingRelay {
            fail: true,
            ..RecordingRelay::default()
        };

        let transmitter =
            ManifestTransmitter::new(&account, Arc::new(JsonManifestTemplate), Some(Box::new(relay)));
        let err = transmitter.transmit(&batch, &store).unwrap_err();

        assert!(err.is_retriable());
        assert!(err.to_string().contains("recording relay: connection refused"));
        assert!(store.entries().expect("entries").iter().all(|e| e.is_draft()));

        let retry = store.draft_batch(account.name()).expect("batch");
        assert_eq!(retry, batch);
    }

    #[test]
    fn missing_relay_is_a_configuration_error() {
        let account = account();
        let store = MemoryEntryStore::new();
        let batch = queued(&store, &account);

        let transmitter = ManifestTransmitter::from_account(&account, Arc::new(JsonManifestTemplate))
            .expect("transmitter");
        let err = transmitter.transmit(&batch, &store).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(store.entries().expect("entries").iter().all(|e| e.is_draft()));
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let account = account();
        let store = MemoryEntryStore::new();
        let relay = RecordingRelay::default();
        let sent = Arc::clone(&relay.sent);
        let transmitter =
            ManifestTransmitter::new(&account, Arc::new(JsonManifestTemplate), Some(Box::new(relay)));

        let result = transmitter
            .transmit(&Batch::new(account.name(), Vec::new()), &store)
            .expect("transmit");
        assert!(result.is_noop());
        assert!(result.receipt(account.name()).is_none());
        assert!(sent.lock().expect("lock").is_empty());
    }

    #[test]
    fn foreign_batch_is_rejected() {
        let account = account();
        let store = MemoryEntryStore::new();
        let batch = queued(&store, &account);
        let other = CarrierAccount::new("other", account.range())
            .with_emails("a@b.example", None, "c@d.example");
        let transmitter = ManifestTransmitter::new(
            &other,
            Arc::new(JsonManifestTemplate),
            Some(Box::new(RecordingRelay::default())),
        );
        assert!(matches!(
            transmitter.transmit(&batch, &store),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn spool_relay_from_account_config() {
        let td = tempdir().expect("tempdir");
        let outbox = td.path().join("outbox");
        let account = account().with_relay(RelayConfig::Spool { dir: outbox.clone() });
        let store = MemoryEntryStore::new();
        let batch = queued(&store, &account);

        let transmitter = ManifestTransmitter::from_account(&account, Arc::new(JsonManifestTemplate))
            .expect("transmitter");
        assert!(transmitter.relay_description().expect("relay").starts_with("spool"));
        transmitter.transmit(&batch, &store).expect("transmit");

        let spooled = SpoolRelay::new(outbox).spooled().expect("spooled");
        assert_eq!(spooled.len(), 1);
        assert_eq!(spooled[0].to.len(), 2);
    }

    #[test]
    fn http_timeout_is_a_transmission_error() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let url = format!("http://{}/send", server.server_addr());
        let handle = std::thread::spawn(move || {
            let req = server.recv().expect("request");
            std::thread::sleep(Duration::from_millis(600));
            let _ = req.respond(tiny_http::Response::from_string("{}"));
        });

        let account = account().with_relay(RelayConfig::Http {
            url,
            token: None,
            secret: None,
            timeout: Duration::from_millis(100),
        });
        let store = MemoryEntryStore::new();
        let batch = queued(&store, &account);

        let transmitter = ManifestTransmitter::from_account(&account, Arc::new(JsonManifestTemplate))
            .expect("transmitter");
        let err = transmitter.transmit(&batch, &store).unwrap_err();
        assert!(matches!(err, Error::Transmission(_)));
        assert!(store.entries().expect("entries").iter().all(|e| e.is_draft()));
        handle.join().expect("join");
    }
}
