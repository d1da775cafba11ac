use std::error::Error;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::{CallSite, ClassNameStyle, Invocation, ServiceStatistics, Template};
use crate::management::{
    self, AttributeInfo, AttributeValue, ManagedObject, ManagementBus, ManagementError,
    ObjectName, DEFAULT_DOMAIN,
};

const ATTRIBUTES: &[AttributeInfo] = &[AttributeInfo::read_only(
    "RegisteredServiceStatisticsCount",
    "Distinct fingerprints seen so far",
)];

/// Fingerprint of one call: the registry key and the published name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub key: String,
    pub display_name: String,
}

/// Keeps the active count and records the invocation when dropped.
struct ActiveInvocation {
    statistics: Arc<ServiceStatistics>,
    started: Instant,
}

impl ActiveInvocation {
    fn begin(statistics: Arc<ServiceStatistics>) -> Self {
        statistics.increment_current_active();
        Self {
            statistics,
            started: Instant::now(),
        }
    }
}

impl Drop for ActiveInvocation {
    fn drop(&mut self) {
        self.statistics.decrement_current_active();
        self.statistics.record_invocation(self.started.elapsed());
    }
}

/// Groups intercepted calls by fingerprint into published `ServiceStatistics`.
///
/// ```ignore
/// let site = CallSite::of::<OrderService>("place").with_name("place(#{args[0]})");
/// let result = interceptor
///     .profile(&site, &Invocation::new().arg(&country), async { place(country).await })
///     .await;
/// ```
pub struct ProfileInterceptor {
    domain: String,
    name: Option<String>,
    class_name_style: ClassNameStyle,
    bus: Arc<dyn ManagementBus>,
    statistics: DashMap<String, Arc<ServiceStatistics>>,
    templates: DashMap<String, Arc<Template>>,
    object_name: OnceLock<ObjectName>,
}

impl ProfileInterceptor {
    pub fn new(bus: Arc<dyn ManagementBus>) -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            name: None,
            class_name_style: ClassNameStyle::default(),
            bus,
            statistics: DashMap::new(),
            templates: DashMap::new(),
            object_name: OnceLock::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_class_name_style(mut self, style: ClassNameStyle) -> Self {
        self.class_name_style = style;
        self
    }

    pub fn class_name_style(&self) -> ClassNameStyle {
        self.class_name_style
    }

    /// Publish the interceptor itself on its bus.
    pub fn register(self: &Arc<Self>) -> management::Result<ObjectName> {
        let name = self
            .bus
            .publish(Arc::clone(self) as Arc<dyn ManagedObject>)?;
        info!(name = %name, style = %self.class_name_style, "Published profile interceptor");
        Ok(name)
    }

    /// Number of distinct fingerprints seen so far.
    pub fn registered_count(&self) -> usize {
        self.statistics.len()
    }

    pub fn service_statistics(&self, key: &str) -> Option<Arc<ServiceStatistics>> {
        self.statistics.get(key).map(|e| Arc::clone(e.value()))
    }

    fn template(&self, source: &str) -> Arc<Template> {
        if let Some(cached) = self.templates.get(source) {
            return Arc::clone(cached.value());
        }
        let template = match Template::parse(source) {
            Ok(template) => template,
            Err(e) => {
                warn!(template = source, error = %e, "Invalid name template, using it verbatim");
                Template::literal(source)
            }
        };
        let template = Arc::new(template);
        self.templates
            .insert(source.to_string(), Arc::clone(&template));
        template
    }

    /// Compute the fingerprint of a call.
    pub fn fingerprint(&self, site: &CallSite, invocation: &Invocation) -> Fingerprint {
        match site.name() {
            Some(source) => {
                let template = self.template(source);
                let name = if template.is_literal() {
                    template.source().to_string()
                } else {
                    template.render(invocation.args(), invocation.receiver())
                };
                Fingerprint {
                    key: name.clone(),
                    display_name: name,
                }
            }
            None => Fingerprint {
                key: format!("{}.{}", site.declaring_type(), site.method()),
                display_name: format!(
                    "{}.{}",
                    self.class_name_style.render(site.declaring_type()),
                    site.method()
                ),
            },
        }
    }

    /// Statistics for the call's fingerprint, created and published on
    /// first sight.
    pub fn statistics_for(&self, site: &CallSite, invocation: &Invocation) -> Arc<ServiceStatistics> {
        let fingerprint = self.fingerprint(site, invocation);
        if let Some(existing) = self.statistics.get(&fingerprint.key) {
            return Arc::clone(existing.value());
        }

        let object_name = ObjectName::typed(
            &self.domain,
            "ServiceStatistics",
            Some(&fingerprint.display_name),
        );
        let (statistics, inserted) = match self.statistics.entry(fingerprint.key.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let created = Arc::new(ServiceStatistics::new(
                    fingerprint.key.clone(),
                    object_name,
                    site,
                ));
                entry.insert(Arc::clone(&created));
                (created, true)
            }
        };

        if inserted {
            match self
                .bus
                .publish(Arc::clone(&statistics) as Arc<dyn ManagedObject>)
            {
                Ok(name) => debug!(name = %name, "Published service statistics"),
                Err(e) => warn!(
                    fingerprint = %fingerprint.key,
                    error = %e,
                    "Failed to publish service statistics"
                ),
            }
        }
        statistics
    }

    /// Profile an async call.
    ///
    /// The outcome is returned unchanged. A dropped future still counts as
    /// one invocation.
    pub async fn profile<F, T, E>(
        &self,
        site: &CallSite,
        invocation: &Invocation,
        call: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let statistics = self.statistics_for(site, invocation);
        let _active = ActiveInvocation::begin(Arc::clone(&statistics));
        let result = call.await;
        if let Err(e) = &result {
            statistics.record_error(e);
        }
        result
    }

    /// Profile a blocking call.
    pub fn profile_blocking<F, T, E>(
        &self,
        site: &CallSite,
        invocation: &Invocation,
        call: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Error + 'static,
    {
        let statistics = self.statistics_for(site, invocation);
        let _active = ActiveInvocation::begin(Arc::clone(&statistics));
        let result = call();
        if let Err(e) = &result {
            statistics.record_error(e);
        }
        result
    }
}

impl ManagedObject for ProfileInterceptor {
    fn object_name(&self) -> ObjectName {
        self.object_name
            .get_or_init(|| {
                ObjectName::typed(&self.domain, "ProfileInterceptor", self.name.as_deref())
            })
            .clone()
    }

    fn attributes(&self) -> Vec<AttributeInfo> {
        ATTRIBUTES.to_vec()
    }

    fn get_attribute(&self, attribute: &str) -> management::Result<AttributeValue> {
        match attribute {
            "RegisteredServiceStatisticsCount" => Ok(self.registered_count().into()),
            other => Err(ManagementError::unknown_attribute(other)),
        }
    }
}
