//! Harvest engine: the request / extract / paginate loop for one repository.
//!
//! A [`Harvester`] runs one harvest at a time on the calling thread. Every
//! run emits `STARTED`, a `RESPONSE_RECEIVED` / `RESPONSE_PROCESSED` pair per
//! page, and exactly one final `ENDED`, to the run's [`ResponseHandler`] and
//! to every registered [`HarvestObserver`].

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use oaiharvest_core::{CancelToken, Transport};
use url::Url;

use crate::error::HarvestError;
use crate::extract::{RecordExtractor, RecordHooks};
use crate::notification::{HarvestNotification, HarvestObserver, HarvestStats, NotificationType};
use crate::params::HarvestParameters;
use crate::protocol::ProtocolError;
use crate::record::HarvestedRecord;
use crate::response::read_page;

/// Per-run callbacks: lifecycle hooks plus the record consumer.
pub trait ResponseHandler: Send {
    /// Hooks used to build records for this run.
    fn record_hooks(&mut self, params: &HarvestParameters) -> RecordHooks {
        RecordHooks::for_base_url(params.base_uri().as_str())
    }

    fn on_harvest_start(&mut self, _notification: &HarvestNotification) {}

    fn on_response_received(&mut self, _notification: &HarvestNotification) {}

    fn on_response_processed(&mut self, _notification: &HarvestNotification) {}

    fn on_harvest_end(&mut self, _notification: &HarvestNotification) {}

    /// Take ownership of a finalized record. An error ends the harvest.
    fn on_record(&mut self, record: HarvestedRecord) -> Result<(), HarvestError>;
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    pub records: Vec<HarvestedRecord>,
}

impl ResponseHandler for CollectingHandler {
    fn on_record(&mut self, record: HarvestedRecord) -> Result<(), HarvestError> {
        self.records.push(record);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    Idle,
    Running,
    ResponsePending,
    Extracting,
    Ended,
}

/// Mutable bookkeeping of one run.
struct Run {
    params: Arc<HarvestParameters>,
    stats: HarvestStats,
    resumption_token: Option<String>,
    last_response: Option<DateTime<Utc>>,
    errors: Vec<ProtocolError>,
}

impl Run {
    fn notification(
        &self,
        kind: NotificationType,
        cause: Option<Arc<HarvestError>>,
        cancel: &CancelToken,
    ) -> HarvestNotification {
        HarvestNotification {
            kind,
            running: kind != NotificationType::Ended,
            explicitly_stopped: cancel.is_stopped(),
            interrupted: cancel.is_interrupted(),
            cause,
            resumption_token: self.resumption_token.clone(),
            last_response: self.last_response,
            params: Arc::clone(&self.params),
            stats: self.stats,
        }
    }
}

pub struct HarvesterBuilder {
    transport: Arc<dyn Transport>,
    observers: Vec<Arc<dyn HarvestObserver>>,
    cancel: CancelToken,
}

impl HarvesterBuilder {
    pub fn observer(mut self, observer: Arc<dyn HarvestObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Share an existing token, e.g. one owned by a worker pool.
    /// The token is cleared whenever a run ends.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Harvester {
        Harvester {
            transport: self.transport,
            observers: self.observers,
            cancel: self.cancel,
            state: Mutex::new(HarvestState::Idle),
        }
    }
}

/// Drives one OAI-PMH harvest.
pub struct Harvester {
    transport: Arc<dyn Transport>,
    observers: Vec<Arc<dyn HarvestObserver>>,
    cancel: CancelToken,
    state: Mutex<HarvestState>,
}

impl Harvester {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    pub fn builder(transport: Arc<dyn Transport>) -> HarvesterBuilder {
        HarvesterBuilder {
            transport,
            observers: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn state(&self) -> HarvestState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: HarvestState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state(), HarvestState::Idle | HarvestState::Ended)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Ask the harvest to end before its next request.
    pub fn stop(&self) {
        self.cancel.stop();
    }

    /// Like [`stop`](Self::stop), but flagged as an interruption.
    pub fn interrupt(&self) {
        self.cancel.interrupt();
    }

    /// Run a harvest to completion on the calling thread.
    ///
    /// Returns the `ENDED` notification, which carries the failure cause if
    /// the harvest did not finish normally. `Err` is returned only when the
    /// harvest could not start at all; then no notification is emitted.
    pub fn start(
        &self,
        params: &HarvestParameters,
        handler: &mut dyn ResponseHandler,
    ) -> Result<HarvestNotification, HarvestError> {
        params.validate()?;
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(
                *state,
                HarvestState::Running | HarvestState::ResponsePending | HarvestState::Extracting
            ) {
                return Err(HarvestError::AlreadyRunning);
            }
            *state = HarvestState::Running;
        }

        let base = params.base_uri().as_str();
        let mut run = Run {
            params: Arc::new(params.clone()),
            stats: HarvestStats::default(),
            resumption_token: None,
            last_response: None,
            errors: Vec::new(),
        };

        log::info!("{base}: harvest started ({})", params.verb());
        let started = run.notification(NotificationType::Started, None, &self.cancel);
        handler.on_harvest_start(&started);
        self.notify(&started);

        let mut extractor = RecordExtractor::new(handler.record_hooks(params));
        let mut url = params.first_request_url();
        let cause = loop {
            if self.cancel.is_cancelled() {
                let how = if self.cancel.is_stopped() {
                    "stopped"
                } else {
                    "interrupted"
                };
                log::warn!("{base}: harvest {how} after {} requests", run.stats.requests);
                break None;
            }
            match self.exchange(&mut run, &url, &mut extractor, handler) {
                Ok(Some(token)) => url = params.resumption_url(&token),
                Ok(None) => break None,
                Err(cause) => break Some(cause),
            }
        };

        let ended = run.notification(NotificationType::Ended, cause, &self.cancel);
        // the flags belong to this run; a stop from here on applies to the next
        self.cancel.reset();
        self.set_state(HarvestState::Ended);
        match &ended.cause {
            Some(cause) => log::error!("{base}: harvest failed: {cause}"),
            None => log::info!(
                "{base}: harvest ended ({} requests, {} records)",
                ended.stats.requests,
                ended.stats.records
            ),
        }
        handler.on_harvest_end(&ended);
        self.notify(&ended);
        Ok(ended)
    }

    /// One request/response/extract cycle.
    ///
    /// Returns the next page's token, `None` at the end of the list.
    fn exchange(
        &self,
        run: &mut Run,
        url: &Url,
        extractor: &mut RecordExtractor,
        handler: &mut dyn ResponseHandler,
    ) -> Result<Option<String>, Arc<HarvestError>> {
        let base = run.params.base_uri().as_str().to_string();

        self.set_state(HarvestState::ResponsePending);
        run.stats.requests += 1;
        log::debug!("{base}: request {} {url}", run.stats.requests);
        let response = self
            .transport
            .execute(url)
            .map_err(|e| Arc::new(HarvestError::from(e)))?;

        run.last_response = Some(Utc::now());
        let received = run.notification(NotificationType::ResponseReceived, None, &self.cancel);
        handler.on_response_received(&received);
        self.notify(&received);

        if !response.is_success() {
            return Err(Arc::new(HarvestError::HttpStatus(response.status)));
        }
        run.stats.responses += 1;

        self.set_state(HarvestState::Extracting);
        let records = &mut run.stats.records;
        let page = read_page(response.body, extractor, &mut |record| {
            handler.on_record(record)?;
            *records += 1;
            Ok(())
        });

        let result = match page {
            Ok(page) => {
                log::debug!(
                    "{base}: {} records, token {:?}, list size {:?}",
                    page.records,
                    page.resumption_token,
                    page.complete_list_size
                );
                if page.response_date.is_some() {
                    run.last_response = page.response_date;
                }
                for error in page.errors {
                    if error.is_no_records_match() {
                        log::debug!("{base}: no records match");
                    } else {
                        log::warn!("{base}: repository error {error}");
                        run.errors.push(error);
                    }
                }
                run.resumption_token = page.resumption_token;
                match &run.resumption_token {
                    Some(token) => Ok(Some(token.clone())),
                    None if !run.errors.is_empty() => {
                        Err(Arc::new(HarvestError::Protocol(run.errors.clone())))
                    }
                    None => Ok(None),
                }
            }
            Err(e) => {
                extractor.reset();
                Err(Arc::new(e))
            }
        };

        let processed = run.notification(
            NotificationType::ResponseProcessed,
            result.as_ref().err().cloned(),
            &self.cancel,
        );
        handler.on_response_processed(&processed);
        self.notify(&processed);
        result
    }

    fn notify(&self, notification: &HarvestNotification) {
        for observer in &self.observers {
            observer.on_harvest_notification(notification);
        }
    }
}
