use crate::{
    rsip_ext::{contact_param, extract_uri_from_contact, header_value},
    transaction::{
        make_call_id, make_tag,
        sender::{RequestSender, TransactionUser},
    },
    ua::{
        events::{Cause, UaEvent},
        UserAgentInner,
    },
    Error, Result,
};
use async_trait::async_trait;
use rsip::{
    prelude::{HasHeaders, UntypedHeader},
    Header, Method, StatusCodeKind,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Refresh this many seconds before the granted expiry runs out.
const REFRESH_MARGIN: u32 = 3;

struct RegistratorInner {
    ua: Arc<UserAgentInner>,
    call_id: String,
    cseq: AtomicU32,
    /// Requested Contact expiry; bumped by 423 Min-Expires.
    expires: Mutex<u32>,
    registered: AtomicBool,
    registered_before: AtomicBool,
    /// At most one in-flight REGISTER.
    registering: AtomicBool,
    /// One retry per 423.
    retried_423: AtomicBool,
    unregistering: AtomicBool,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

/// Registrar client: periodic REGISTER with refresh,
/// 423 handling and GRUU extraction.
#[derive(Clone)]
pub struct Registrator {
    inner: Arc<RegistratorInner>,
}

struct RegisterApplicant {
    inner: Arc<RegistratorInner>,
}

impl Registrator {
    pub(crate) fn new(ua: Arc<UserAgentInner>) -> Self {
        let call_id = make_call_id(&ua.settings.via_host).value().to_string();
        let expires = ua.settings.config.register_expires;
        Self {
            inner: Arc::new(RegistratorInner {
                ua,
                call_id,
                cseq: AtomicU32::new(0),
                expires: Mutex::new(expires),
                registered: AtomicBool::new(false),
                registered_before: AtomicBool::new(false),
                registering: AtomicBool::new(false),
                retried_423: AtomicBool::new(false),
                unregistering: AtomicBool::new(false),
                refresh: Mutex::new(None),
            }),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Relaxed)
    }

    pub(crate) fn on_transport_connected(&self) {
        if self.inner.ua.settings.config.register {
            let registrator = self.clone();
            tokio::spawn(async move {
                registrator.register().await.ok();
            });
        }
    }

    /// Transport is gone: no wire traffic, just forget the binding.
    pub(crate) fn on_transport_closed(&self) {
        self.inner.clear_refresh();
        self.inner.registering.store(false, Ordering::Relaxed);
        if self.inner.registered.swap(false, Ordering::Relaxed) {
            self.inner.ua.emit(UaEvent::Unregistered { cause: None });
        }
    }

    pub async fn register(&self) -> Result<()> {
        self.inner.retried_423.store(false, Ordering::Relaxed);
        self.inner.send_register().await
    }

    /// `Contact: *` + `Expires: 0` wipes every binding; otherwise
    /// only ours is removed.
    pub async fn unregister(&self, all: bool) -> Result<()> {
        self.inner.clear_refresh();
        self.inner.unregistering.store(true, Ordering::Relaxed);

        let cseq = self.inner.cseq.fetch_add(1, Ordering::Relaxed) + 1;
        let settings = &self.inner.ua.settings;
        let contact_header: Header = if all {
            Header::Contact("*".into())
        } else {
            Header::Contact(format!("<{}>;expires=0", self.inner.ua.contact_uri()).into())
        };
        let request = self.inner.ua.create_request(
            Method::Register,
            settings.registrar_uri(),
            settings.uri.clone(),
            &make_tag().to_string(),
            &self.inner.call_id,
            cseq,
            vec![contact_header, Header::Expires("0".into())],
            None,
        );
        RequestSender::new(
            self.inner.ua.core.clone(),
            request,
            Arc::new(RegisterApplicant {
                inner: self.inner.clone(),
            }),
            self.inner.ua.credential(),
            self.inner.ua.is_user_closed(),
        )
        .spawn();
        Ok(())
    }

    /// UA shutdown: unregister when bound, then stop refreshing.
    pub(crate) async fn close(&self) {
        self.inner.clear_refresh();
        if self.inner.registered.load(Ordering::Relaxed) {
            self.unregister(false).await.ok();
        }
    }
}

impl RegistratorInner {
    fn clear_refresh(&self) {
        if let Some(handle) = self.refresh.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn send_register(self: &Arc<Self>) -> Result<()> {
        if self
            .registering
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::InvalidState("REGISTER already in flight".to_string()));
        }
        self.unregistering.store(false, Ordering::Relaxed);

        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed) + 1;
        let expires = *self.expires.lock().unwrap();
        let settings = &self.ua.settings;

        let contact = format!(
            "<{}>;reg-id=1;+sip.instance=\"<{}>\";expires={}",
            self.ua.contact_uri(),
            settings.instance_id,
            expires
        );
        let request = self.ua.create_request(
            Method::Register,
            settings.registrar_uri(),
            settings.uri.clone(),
            &make_tag().to_string(),
            &self.call_id,
            cseq,
            vec![
                Header::Contact(contact.into()),
                Header::Expires(expires.to_string().into()),
                Header::Supported(crate::ua::SUPPORTED_EXTENSIONS.into()),
            ],
            None,
        );
        debug!(cseq, expires, "sending REGISTER");
        RequestSender::new(
            self.ua.core.clone(),
            request,
            Arc::new(RegisterApplicant {
                inner: self.clone(),
            }),
            self.ua.credential(),
            self.ua.is_user_closed(),
        )
        .spawn();
        Ok(())
    }

    fn schedule_refresh(self: &Arc<Self>, granted: u32) {
        let wait = Duration::from_secs(u64::from(granted.saturating_sub(REFRESH_MARGIN)));
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            debug!("registration refresh due");
            inner.send_register().await.ok();
        });
        let mut refresh = self.refresh.lock().unwrap();
        if let Some(previous) = refresh.replace(handle) {
            previous.abort();
        }
    }

    /// Find the Contact entry the registrar echoed for our binding.
    fn matching_contact(&self, response: &rsip::Response) -> Option<String> {
        let our_uri = self.ua.contact_uri();
        let our_base = format!(
            "{}@{}",
            our_uri.auth.as_ref().map(|a| a.user.clone()).unwrap_or_default(),
            our_uri.host_with_port.host
        )
        .to_lowercase();
        for header in response.headers().iter() {
            if let Header::Contact(contact) = header {
                if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                    let base = format!(
                        "{}@{}",
                        uri.auth.as_ref().map(|a| a.user.clone()).unwrap_or_default(),
                        uri.host_with_port.host
                    )
                    .to_lowercase();
                    if base == our_base {
                        return Some(contact.value().to_string());
                    }
                }
            }
        }
        None
    }

    fn on_register_ok(self: &Arc<Self>, response: &rsip::Response) {
        if self.unregistering.load(Ordering::Relaxed) {
            self.registered.store(false, Ordering::Relaxed);
            self.ua.emit(UaEvent::Unregistered { cause: None });
            return;
        }

        let requested = *self.expires.lock().unwrap();
        let contact = self.matching_contact(response);

        // expiry resolution order: our Contact's expires param, the
        // global Expires header, the value we asked for
        let granted = contact
            .as_deref()
            .and_then(|c| contact_param(c, "expires"))
            .and_then(|v| v.parse::<u32>().ok())
            .or_else(|| {
                header_value(response.headers(), "Expires")
                    .and_then(|v| v.trim().parse::<u32>().ok())
            })
            .unwrap_or(requested);

        if let Some(contact) = contact.as_deref() {
            let gruu = contact_param(contact, "temp-gruu")
                .or_else(|| contact_param(contact, "pub-gruu"));
            if let Some(gruu) = gruu {
                if let Ok(uri) = rsip::Uri::try_from(gruu.as_str()) {
                    self.ua.set_gruu(uri);
                }
            }
        }

        info!(granted, "registered");
        self.schedule_refresh(granted);
        let newly = !self.registered.swap(true, Ordering::Relaxed);
        self.registered_before.store(true, Ordering::Relaxed);
        if newly {
            self.ua.emit(UaEvent::Registered { expires: granted });
        }
    }

    async fn on_register_failure(
        self: &Arc<Self>,
        response: Option<rsip::Response>,
        cause: Cause,
    ) {
        // 423: take the registrar's floor and retry once
        if let Some(resp) = response.as_ref() {
            if resp.status_code.code() == 423
                && !self.retried_423.swap(true, Ordering::Relaxed)
            {
                if let Some(min) = header_value(resp.headers(), "Min-Expires")
                    .and_then(|v| v.trim().parse::<u32>().ok())
                {
                    info!(min, "423 Interval Too Brief, retrying");
                    *self.expires.lock().unwrap() = min;
                    self.registering.store(false, Ordering::Relaxed);
                    self.send_register().await.ok();
                    return;
                }
            }
        }

        warn!(cause = %cause, "registration failed");
        self.ua.emit(UaEvent::RegistrationFailed { response, cause });
        if self.registered.swap(false, Ordering::Relaxed) {
            self.ua.emit(UaEvent::Unregistered { cause: Some(cause) });
        }
    }
}

#[async_trait]
impl TransactionUser for RegisterApplicant {
    async fn receive_response(&self, response: rsip::Response) {
        let inner = &self.inner;
        match response.status_code.kind() {
            StatusCodeKind::Provisional => {}
            StatusCodeKind::Successful => {
                inner.registering.store(false, Ordering::Relaxed);
                inner.on_register_ok(&response);
            }
            _ => {
                inner.registering.store(false, Ordering::Relaxed);
                let cause = Cause::from_status(response.status_code.code());
                inner.on_register_failure(Some(response), cause).await;
            }
        }
    }

    async fn on_request_timeout(&self) {
        self.inner.registering.store(false, Ordering::Relaxed);
        self.inner
            .on_register_failure(None, Cause::RequestTimeout)
            .await;
    }

    async fn on_transport_error(&self, _error: String) {
        self.inner.registering.store(false, Ordering::Relaxed);
        self.inner
            .on_register_failure(None, Cause::ConnectionError)
            .await;
    }

    fn next_cseq_for_retry(&self) -> Option<u32> {
        Some(self.inner.cseq.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
