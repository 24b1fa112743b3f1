use std::net::Ipv4Addr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use reqwest::cookie::CookieStore;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

const CSRF_COOKIE: &str = "csrftoken";

static CSRF_FORM_INPUT: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#"name=["']csrfmiddlewaretoken["']\s+value=["']([^"']+)["']"#)
        .expect("static pattern compiles")
});

/// A newly allocated stream to announce to the directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationJob {
    pub group: Ipv4Addr,
    pub source: Ipv4Addr,
    pub port: u16,
    pub description: String,
}

impl RegistrationJob {
    pub fn translated(group: Ipv4Addr, source: Ipv4Addr, port: u16, client: Ipv4Addr) -> Self {
        RegistrationJob {
            group,
            source,
            port,
            description: format!("Translated stream originating from {client}"),
        }
    }

    pub fn stream_url(&self) -> String {
        format!("amt://{}@{}:{}", self.source, self.group, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Invalid directory URL '{0}': {1}")]
    InvalidUrl(String, String),
    #[error("{method} resulted in status code {status}: {body}")]
    UnexpectedStatus {
        method: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("no {CSRF_COOKIE} found in session")]
    MissingToken,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[async_trait::async_trait]
pub trait Directory: Send + Sync + 'static {
    async fn register(&self, job: &RegistrationJob) -> Result<(), RegistrationError>;
}

/// Submits streams through the directory's add form, which is protected by a CSRF token that
/// has to be fetched with a GET in the same cookie session first
pub struct MulticastMenu {
    add_url: reqwest::Url,
    contact: String,
    request_timeout: Duration,
}

impl MulticastMenu {
    pub fn new(config: &mcast_config::RegistrationConfig) -> Result<Self, RegistrationError> {
        let add_url = reqwest::Url::parse(&config.add_url)
            .map_err(|e| RegistrationError::InvalidUrl(config.add_url.clone(), e.to_string()))?;
        Ok(MulticastMenu {
            add_url,
            contact: config.contact.clone(),
            request_timeout: config.request_timeout,
        })
    }
}

#[async_trait::async_trait]
impl Directory for MulticastMenu {
    async fn register(&self, job: &RegistrationJob) -> Result<(), RegistrationError> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .timeout(self.request_timeout)
            .build()?;

        let response = client.get(self.add_url.clone()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status != reqwest::StatusCode::OK {
            return Err(RegistrationError::UnexpectedStatus {
                method: "GET",
                status,
                body,
            });
        }

        let token = jar
            .cookies(&self.add_url)
            .and_then(|header| header.to_str().ok().and_then(csrf_token_from_cookies))
            .or_else(|| csrf_token_from_form(&body))
            .ok_or(RegistrationError::MissingToken)?;

        let group = job.group.to_string();
        let source = job.source.to_string();
        let port = job.port.to_string();
        let form = [
            ("csrfmiddlewaretoken", token.as_str()),
            ("source", source.as_str()),
            ("group", group.as_str()),
            ("udp_port", port.as_str()),
            ("email", self.contact.as_str()),
            ("description", job.description.as_str()),
            ("Add", "Add"),
        ];

        let response = client
            .post(self.add_url.clone())
            .header(reqwest::header::REFERER, self.add_url.as_str())
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(RegistrationError::UnexpectedStatus {
                method: "POST",
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

/// Extracts the CSRF token from a `Cookie` header value
pub fn csrf_token_from_cookies(header: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == CSRF_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Extracts the CSRF token from the hidden input of the rendered form
pub fn csrf_token_from_form(html: &str) -> Option<String> {
    CSRF_FORM_INPUT
        .captures(html)
        .map(|captures| captures[1].to_string())
}

/// Fixed set of workers announcing streams in the background. Submitting never blocks and
/// failures never reach the caller.
pub struct Registrar {
    jobs: mpsc::UnboundedSender<RegistrationJob>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<RegistrationJob>>>,
    cancel: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Registrar {
    pub fn new(directory: Arc<dyn Directory>, worker_count: usize) -> std::io::Result<Self> {
        let (jobs, queue) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(queue));
        let (cancel, _) = watch::channel(false);

        let workers = (0..worker_count.max(1))
            .map(|index| {
                tokio::task::Builder::new()
                    .name(&format!("registration worker {index}"))
                    .spawn(Self::work(directory.clone(), queue.clone(), cancel.subscribe()))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Registrar {
            jobs,
            queue,
            cancel,
            workers,
        })
    }

    async fn work(
        directory: Arc<dyn Directory>,
        queue: Arc<Mutex<mpsc::UnboundedReceiver<RegistrationJob>>>,
        mut cancel: watch::Receiver<bool>,
    ) {
        loop {
            let job = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.wait_for(|cancelled| *cancelled) => return,
                    job = queue.recv() => match job {
                        Some(job) => job,
                        None => return,
                    },
                }
            };

            match directory.register(&job).await {
                Ok(()) => tracing::event!(
                    tracing::Level::INFO,
                    stream = %job.stream_url(),
                    description = %job.description,
                    "REGISTRATION_SUCCEEDED"
                ),
                Err(e) => tracing::event!(
                    tracing::Level::WARN,
                    stream = %job.stream_url(),
                    description = %job.description,
                    error = %e,
                    "REGISTRATION_FAILED"
                ),
            }
        }
    }

    /// Queues a job; returns false once the pool is shutting down
    pub fn submit(&self, job: RegistrationJob) -> bool {
        if *self.cancel.borrow() {
            return false;
        }
        self.jobs.send(job).is_ok()
    }

    /// Lets jobs already being processed finish and discards everything still queued.
    /// Returns the number of discarded jobs.
    pub async fn shutdown(self) -> usize {
        self.cancel.send_replace(true);
        drop(self.jobs);

        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                tracing::warn!("Registration worker failed: {}", e);
            }
        }

        let mut queue = self.queue.lock().await;
        let mut discarded = 0;
        while queue.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::event!(tracing::Level::INFO, discarded, "REGISTRATION_JOBS_DISCARDED");
        }
        discarded
    }
}
