//! Formatted publication of keywords into the image-stream header.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::store::KeywordStore;
use super::table::KeywordTable;
use super::KeywordValue;
use crate::error::{AppResult, CamstackError};
use crate::modes::CameraMode;
use crate::shm::ImageStream;

/// Keyword table of a camera bound to its current image stream.
#[derive(Debug)]
pub struct KeywordPipeline {
    table: KeywordTable,
    stream: Option<Arc<dyn ImageStream>>,
}

impl KeywordPipeline {
    /// Pipeline over `table`, not yet attached to a stream.
    pub fn new(table: KeywordTable) -> Self {
        Self {
            table,
            stream: None,
        }
    }

    /// Keywords this camera publishes.
    pub fn table(&self) -> &KeywordTable {
        &self.table
    }

    /// Publish into `stream` from now on.
    pub fn attach(&mut self, stream: Arc<dyn ImageStream>) {
        self.stream = Some(stream);
    }

    /// Stop publishing, returning the stream.
    pub fn detach(&mut self) -> Option<Arc<dyn ImageStream>> {
        self.stream.take()
    }

    /// Attached stream, if any.
    pub fn stream(&self) -> Option<&Arc<dyn ImageStream>> {
        self.stream.as_ref()
    }

    fn attached(&self) -> AppResult<&Arc<dyn ImageStream>> {
        self.stream
            .as_ref()
            .ok_or_else(|| CamstackError::Keyword("no image stream attached".into()))
    }

    /// Project `value` onto the declared format of `key`.
    ///
    /// Malformed values are logged and passed through unformatted.
    pub fn format(&self, key: &str, value: &KeywordValue) -> AppResult<KeywordValue> {
        let spec = self.table.spec(key)?;
        Ok(match spec.format.apply(value) {
            Ok(v) => v,
            Err(e) => {
                error!(keyword = key, ?value, format = %spec.format, "formatting error: {e}");
                value.clone()
            }
        })
    }

    /// Format `value` per the table and write it into the stream header.
    pub fn set_formatted_keyword(
        &self,
        key: &str,
        value: impl Into<KeywordValue>,
    ) -> AppResult<KeywordValue> {
        let formatted = self.format(key, &value.into())?;
        self.attached()?.update_keyword(key, &formatted)?;
        Ok(formatted)
    }

    /// Raw header value of `key`; `None` when the worker has not written it.
    pub fn get_keyword(&self, key: &str) -> AppResult<Option<KeywordValue>> {
        Ok(self.attached()?.get_keyword(key))
    }

    /// Initialise the header of a freshly grabbed stream.
    ///
    /// Keywords already written by the worker are kept; declared keywords are
    /// (re)written with their defaults and descriptions, then the geometry of
    /// `mode` is published.
    pub fn fill_keywords(&self, mode: &CameraMode, detector: &str, cropped: bool) -> AppResult<()> {
        let stream = self.attached()?;
        let preexisting = stream.keywords();
        debug!(
            stream = %stream.stream_name(),
            preexisting = preexisting.len(),
            declared = self.table.len(),
            "filling keywords"
        );

        for (name, spec) in self.table.iter() {
            let value = self.format(name, &spec.default)?;
            stream.set_keyword(name, &value, &spec.description)?;
        }

        self.set_formatted_keyword("DETECTOR", detector)?;
        self.set_formatted_keyword("BIN-FCT1", mode.binx)?;
        self.set_formatted_keyword("BIN-FCT2", mode.biny)?;
        self.set_formatted_keyword("PRD-MIN1", mode.x0)?;
        self.set_formatted_keyword("PRD-MIN2", mode.y0)?;
        self.set_formatted_keyword("PRD-RNG1", mode.width())?;
        self.set_formatted_keyword("PRD-RNG2", mode.height())?;
        self.set_formatted_keyword("CROPPED", cropped)?;
        if let Some(tint) = mode.tint {
            self.set_formatted_keyword("EXPTIME", tint)?;
        }
        if let Some(fps) = mode.fps {
            self.set_formatted_keyword("FRATE", fps)?;
        }
        Ok(())
    }

    /// `(prefix + short key, value)` for every mirrored keyword present in the stream.
    pub fn store_entries(&self, prefix: &str) -> Vec<(String, KeywordValue)> {
        let Some(stream) = self.stream.as_ref() else {
            return Vec::new();
        };
        stream
            .keywords()
            .into_iter()
            .filter_map(|(name, kw)| {
                let short = self.table.get(&name)?.short_key.as_ref()?;
                Some((format!("{prefix}{short}"), kw.value))
            })
            .collect()
    }

    /// Mirror the header into `store`, giving up after `timeout`. Failures
    /// are logged, never returned.
    pub async fn push_to_store(&self, store: &dyn KeywordStore, prefix: &str, timeout: Duration) {
        let entries = self.store_entries(prefix);
        if entries.is_empty() {
            return;
        }
        match tokio::time::timeout(timeout, store.push(&entries)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(store = %store.describe(), "keyword mirror push failed: {e}"),
            Err(_) => error!(
                store = %store.describe(),
                timeout_ms = timeout.as_millis() as u64,
                "keyword mirror push timed out"
            ),
        }
    }
}
