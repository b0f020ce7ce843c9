use super::{lock, served_image_url, JobStore};
use crate::error::{JobError, ProviderError};
use crate::events::{parse_local_image_ref, LocalImage};
use crate::models::{Category, NewKbEntry, QaCandidate};
use crate::stores::content_key;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use url::Url;

const PROMOTED_PREFIX: &str = "kb";

/// One reviewed candidate. Omitted fields keep the generated value; an empty
/// `image_url` removes the image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalItem {
    pub candidate_id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalFailure {
    pub candidate_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApprovalReport {
    pub saved: usize,
    pub failed: Vec<ApprovalFailure>,
}

/// Per-call view of a finished job used to resolve image references.
struct ImageResolver<'a> {
    store: &'a JobStore,
    job_id: &'a str,
    images: HashMap<String, LocalImage>,
    promoted: HashMap<String, String>,
}

impl ImageResolver<'_> {
    fn served_prefix(&self) -> String {
        served_image_url(&self.store.limits.public_image_base, self.job_id, "")
    }

    /// Key of an image this job holds locally, if `reference` points at one.
    fn local_key<'r>(&self, reference: &'r str) -> Option<&'r str> {
        let served = self.served_prefix();
        parse_local_image_ref(reference)
            .or_else(|| reference.strip_prefix(served.as_str()))
            .filter(|key| !key.is_empty())
    }

    async fn resolve(&mut self, reference: Option<&str>) -> Result<Option<String>, String> {
        let Some(reference) = reference.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(None);
        };

        if let Some(key) = self.local_key(reference) {
            return self.promote(key).await.map(Some);
        }

        match Url::parse(reference) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {
                Ok(Some(reference.to_string()))
            }
            Ok(url) => Err(format!("unsupported image url scheme: {}", url.scheme())),
            Err(error) => Err(format!("invalid image url {reference:?}: {error}")),
        }
    }

    /// Copies a job-held image to durable storage at most once per key.
    /// Without durable storage, or when the upload fails, the job-served URL is used.
    async fn promote(&mut self, key: &str) -> Result<String, String> {
        if let Some(url) = self.promoted.get(key) {
            return Ok(url.clone());
        }
        let image = self
            .images
            .get(key)
            .ok_or_else(|| format!("job holds no image {key}"))?;

        let fallback =
            served_image_url(&self.store.limits.public_image_base, self.job_id, key);
        let url = match &self.store.deps.image_store {
            Some(image_store) => {
                let object_key = content_key(PROMOTED_PREFIX, &image.bytes, &image.mime_type);
                match image_store
                    .upload(&image.bytes, &object_key, &image.mime_type)
                    .await
                {
                    Ok(url) => url,
                    Err(error) => {
                        warn!(job_id = %self.job_id, key, %error, "image promotion failed");
                        fallback
                    }
                }
            }
            None => fallback,
        };

        self.promoted.insert(key.to_string(), url.clone());
        Ok(url)
    }
}

impl JobStore {
    /// Saves reviewed candidates of a finished job as knowledge base entries.
    ///
    /// Each item succeeds or fails on its own; the report counts what was saved.
    pub async fn approve(
        &self,
        job_id: &str,
        items: Vec<ApprovalItem>,
    ) -> Result<ApprovalReport, JobError> {
        if items.is_empty() {
            return Err(JobError::InvalidApproval("no items to approve".to_string()));
        }
        if let Some(item) = items.iter().find(|item| item.candidate_id.trim().is_empty()) {
            return Err(JobError::InvalidApproval(format!(
                "item is missing a candidate id: {item:?}"
            )));
        }

        let job = self.get(job_id)?;
        let (candidates, images) = {
            let state = lock(&job.state);
            if !state.status.is_terminal() {
                return Err(JobError::NotFinished(job_id.to_string()));
            }
            let candidates: HashMap<String, QaCandidate> = state
                .candidates
                .iter()
                .map(|candidate| (candidate.id.clone(), candidate.clone()))
                .collect();
            (candidates, state.images.clone())
        };

        let mut resolver = ImageResolver {
            store: self,
            job_id,
            images,
            promoted: HashMap::new(),
        };
        let mut report = ApprovalReport::default();

        for item in items {
            let candidate_id = item.candidate_id.clone();
            match self.approve_one(&candidates, &mut resolver, item).await {
                Ok(entry_id) => {
                    info!(
                        job_id,
                        candidate = %candidate_id,
                        entry = %entry_id,
                        "candidate approved"
                    );
                    report.saved += 1;
                }
                Err(reason) => {
                    warn!(job_id, candidate = %candidate_id, %reason, "candidate not saved");
                    report.failed.push(ApprovalFailure {
                        candidate_id,
                        reason,
                    });
                }
            }
        }

        Ok(report)
    }

    async fn approve_one(
        &self,
        candidates: &HashMap<String, QaCandidate>,
        resolver: &mut ImageResolver<'_>,
        item: ApprovalItem,
    ) -> Result<String, String> {
        let candidate = candidates
            .get(&item.candidate_id)
            .ok_or_else(|| format!("unknown candidate {}", item.candidate_id))?;

        let question = item.question.unwrap_or_else(|| candidate.question.clone());
        let answer = item.answer.unwrap_or_else(|| candidate.answer.clone());
        if question.trim().is_empty() || answer.trim().is_empty() {
            return Err("question and answer must not be empty".to_string());
        }

        let reference = item.image_url.or_else(|| candidate.image_url.clone());
        let image_url = resolver.resolve(reference.as_deref()).await?;

        let embedding = self
            .deps
            .embedder
            .embed(&question)
            .await
            .map_err(|error: ProviderError| error.to_string())?;

        self.deps
            .knowledge
            .create_entry(NewKbEntry {
                question: question.trim().to_string(),
                answer: answer.trim().to_string(),
                category: item.category.unwrap_or(candidate.category),
                image_url,
                embedding,
            })
            .await
            .map_err(|error| error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{store_for, text_file, wait_until_terminal};
    use super::*;
    use crate::models::{JobLimits, UploadedFile};
    use crate::testing::{FakeImageStore, Harness};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn approve(id: &str) -> ApprovalItem {
        ApprovalItem {
            candidate_id: id.to_string(),
            ..ApprovalItem::default()
        }
    }

    #[tokio::test]
    async fn one_bad_image_url_fails_only_that_item() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::default();
        let store = store_for(&harness, JobLimits::default());
        let id = store.submit(vec![text_file("faq.txt", 4000)])?;
        wait_until_terminal(&store, &id).await?;

        let candidates = store.snapshot(&id)?.candidates;
        assert_eq!(candidates.len(), 5);

        let report = store
            .approve(
                &id,
                vec![
                    ApprovalItem {
                        answer: Some("Edited answer.".to_string()),
                        ..approve(&candidates[0].id)
                    },
                    ApprovalItem {
                        image_url: Some("not a url".to_string()),
                        ..approve(&candidates[3].id)
                    },
                ],
            )
            .await?;

        assert_eq!(report.saved, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].candidate_id, candidates[3].id);

        let entries = harness.knowledge.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].answer, "Edited answer.");
        assert_eq!(entries[0].question, candidates[0].question);
        Ok(())
    }

    #[tokio::test]
    async fn shared_local_image_is_promoted_once() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::default();
        harness.options.chunk_max_chars = 60;
        harness.options.chunk_overlap_chars = 10;
        harness.options.min_chunk_chars = 10;
        // The upload during ingestion fails, so candidates keep a job-held image.
        let durable = Arc::new(FakeImageStore::failing([0]));
        harness.store = Some(durable.clone());
        let store = store_for(&harness, JobLimits::default());

        let id = store.submit(vec![UploadedFile::new(
            "sizes.png",
            None,
            b"\x89PNG-bytes".to_vec(),
        )])?;
        wait_until_terminal(&store, &id).await?;
        let candidates = store.snapshot(&id)?.candidates;
        assert!(candidates.len() >= 2);
        assert!(candidates
            .iter()
            .all(|c| c.image_url.as_deref().is_some_and(|url| url.starts_with("/api/"))));

        let report = store
            .approve(&id, candidates.iter().map(|c| approve(&c.id)).collect())
            .await?;

        assert_eq!(report.saved, candidates.len());
        assert_eq!(durable.calls.load(Ordering::SeqCst), 2);
        let entries = harness.knowledge.entries();
        assert!(entries.iter().all(|entry| entry
            .image_url
            .as_deref()
            .is_some_and(|url| url.starts_with("https://cdn.example.com/kb/"))));
        Ok(())
    }

    #[tokio::test]
    async fn approval_requires_a_finished_job() -> Result<(), Box<dyn std::error::Error>> {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let mut harness = Harness::default();
        harness.generator = Arc::new(crate::testing::FakeGenerator::gated(gate.clone()));
        let store = store_for(&harness, JobLimits::default());
        let id = store.submit(vec![text_file("faq.txt", 300)])?;

        assert!(matches!(
            store.approve(&id, vec![approve("anything")]).await,
            Err(JobError::NotFinished(_))
        ));
        assert!(matches!(
            store.approve(&id, Vec::new()).await,
            Err(JobError::InvalidApproval(_))
        ));
        assert!(matches!(
            store.approve("missing", vec![approve("x")]).await,
            Err(JobError::NotFound(_))
        ));

        gate.add_permits(10);
        wait_until_terminal(&store, &id).await?;
        let report = store.approve(&id, vec![approve("unknown")]).await?;
        assert_eq!(report.saved, 0);
        assert_eq!(report.failed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn external_and_served_urls_are_accepted() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::default();
        let store = store_for(&harness, JobLimits::default());
        let id = store.submit(vec![UploadedFile::new(
            "chart.png",
            None,
            b"chart".to_vec(),
        )])?;
        wait_until_terminal(&store, &id).await?;
        let candidates = store.snapshot(&id)?.candidates;
        let served = candidates[0].image_url.clone().unwrap_or_default();

        let report = store
            .approve(
                &id,
                vec![
                    ApprovalItem {
                        image_url: Some("https://images.example.com/a.png".to_string()),
                        ..approve(&candidates[0].id)
                    },
                    ApprovalItem {
                        image_url: Some("ftp://images.example.com/a.png".to_string()),
                        ..approve(&candidates[0].id)
                    },
                ],
            )
            .await?;
        assert_eq!(report.saved, 1);

        let entries = harness.knowledge.entries();
        assert_eq!(
            entries[0].image_url.as_deref(),
            Some("https://images.example.com/a.png")
        );
        assert!(served.starts_with("/api/ingest/jobs/"));
        Ok(())
    }
}
