use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::*;
use crate::management::{AttributeValue, InMemoryManagementBus, ManagedObject, ManagementBus};

#[derive(Debug, thiserror::Error)]
#[error("insufficient funds")]
struct InsufficientFunds;

#[derive(Debug, thiserror::Error)]
#[error("payment failed")]
struct PaymentFailed(#[source] std::io::Error);

#[derive(Debug, thiserror::Error)]
#[error("order rejected")]
struct OrderRejected(#[source] InsufficientFunds);

/// Reports itself as its own source.
#[derive(Debug)]
struct Cyclic;

impl std::fmt::Display for Cyclic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cyclic")
    }
}

impl Error for Cyclic {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self)
    }
}

/// Shares its address with the wrapped error.
#[derive(Debug, thiserror::Error)]
#[error("gateway unavailable")]
struct GatewayDown(#[source] PaymentFailed);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Shop {
    country_code: String,
}

fn interceptor() -> (Arc<InMemoryManagementBus>, ProfileInterceptor) {
    let bus = Arc::new(InMemoryManagementBus::new());
    let interceptor = ProfileInterceptor::new(bus.clone());
    (bus, interceptor)
}

// ============================================================================
// Classification
// ============================================================================

#[test]
fn test_classify_walks_source_chain() {
    let communication = [ErrorType::of::<std::io::Error>()];
    let business = [ErrorType::of::<InsufficientFunds>()];

    let io = PaymentFailed(std::io::Error::other("reset"));
    assert_eq!(classify(&io, &communication, &business), ErrorClass::Communication);

    let rejected = OrderRejected(InsufficientFunds);
    assert_eq!(classify(&rejected, &communication, &business), ErrorClass::Business);

    assert_eq!(classify(&InsufficientFunds, &[], &[]), ErrorClass::Other);
}

#[test]
fn test_communication_checked_before_business() {
    let both = [ErrorType::of::<PaymentFailed>()];
    let io = PaymentFailed(std::io::Error::other("reset"));
    assert_eq!(classify(&io, &both, &both), ErrorClass::Communication);
}

#[test]
fn test_newtype_sources_at_same_address_are_walked() {
    let error = GatewayDown(PaymentFailed(std::io::Error::other("net")));
    let outer = &error as *const GatewayDown as *const ();
    let inner = &error.0 .0 as *const std::io::Error as *const ();
    assert_eq!(outer, inner);

    let communication = [ErrorType::of::<std::io::Error>()];
    assert_eq!(classify(&error, &communication, &[]), ErrorClass::Communication);
    assert!(contains_error_of_type(&error, &[ErrorType::of::<PaymentFailed>()]));
}

#[test]
fn test_cyclic_source_chain_terminates() {
    let cyclic = Cyclic;
    assert!(!contains_error_of_type(
        &cyclic,
        &[ErrorType::of::<std::io::Error>()]
    ));
    assert!(contains_error_of_type(&cyclic, &[ErrorType::of::<Cyclic>()]));
}

#[test]
fn test_classification_is_deterministic() {
    let communication = [ErrorType::of::<std::io::Error>()];
    let error = PaymentFailed(std::io::Error::other("x"));
    let first = classify(&error, &communication, &[]);
    assert!((0..10).all(|_| classify(&error, &communication, &[]) == first));
}

// ============================================================================
// Templates and naming
// ============================================================================

#[test]
fn test_template_renders_args_and_receiver() {
    let template = Template::parse("svc(#{args[0]}-#{args[1]}-#{invokedObject.countryCode})").unwrap();
    let shop = serde_json::json!({ "countryCode": "FR" });
    let args = vec![serde_json::json!("foo"), serde_json::json!("bar")];
    assert_eq!(template.render(&args, &shop), "svc(foo-bar-FR)");
}

#[test]
fn test_template_missing_values_render_null() {
    let template = Template::parse("#{args[3]}/#{invokedObject.missing}/#{args[0].id}").unwrap();
    let args = vec![serde_json::json!({ "id": 7 })];
    assert_eq!(template.render(&args, &serde_json::Value::Null), "null/null/7");
}

#[test]
fn test_template_reparse_of_source_is_identical() {
    let template = Template::parse("a#{args[0]}b#{invokedObject.x[2]}c").unwrap();
    assert_eq!(Template::parse(template.source()).unwrap(), template);
    assert!(!template.is_literal());
    assert!(Template::parse("plain").unwrap().is_literal());
}

#[test]
fn test_template_parse_errors() {
    assert!(matches!(
        Template::parse("x#{args[0]"),
        Err(TemplateError::Unterminated { position: 1, .. })
    ));
    assert!(matches!(
        Template::parse("#{ }"),
        Err(TemplateError::EmptyExpression { .. })
    ));
    assert!(matches!(
        Template::parse("#{this.name}"),
        Err(TemplateError::UnknownRoot { .. })
    ));
    assert!(matches!(
        Template::parse("#{args[a]}"),
        Err(TemplateError::InvalidExpression { .. })
    ));
}

#[test]
fn test_class_name_styles() {
    assert_eq!(ClassNameStyle::Short.render("java.lang.String"), "String");
    assert_eq!(
        ClassNameStyle::CompactFullyQualified.render("java.lang.String"),
        "j.l.String"
    );
    assert_eq!(
        ClassNameStyle::FullyQualified.render("java.lang.String"),
        "java.lang.String"
    );
    assert_eq!(
        ClassNameStyle::CompactFullyQualified.render("warden::profiling::Shop"),
        "w::p::Shop"
    );
    assert_eq!(ClassNameStyle::Short.render("Plain"), "Plain");
}

#[test]
fn test_class_name_style_parsing() {
    assert_eq!(
        "SHORT_NAME".parse::<ClassNameStyle>().unwrap(),
        ClassNameStyle::Short
    );
    assert_eq!(
        "compact_fully_qualified".parse::<ClassNameStyle>().unwrap(),
        ClassNameStyle::CompactFullyQualified
    );
    assert!("LONG".parse::<ClassNameStyle>().is_err());
}

// ============================================================================
// Interceptor
// ============================================================================

#[test]
fn test_automatic_fingerprint_uses_style_for_display_only() {
    let (_bus, interceptor) = interceptor();
    let interceptor = interceptor.with_class_name_style(ClassNameStyle::Short);
    let site = CallSite::new("com.shop.OrderService", "place");

    let fingerprint = interceptor.fingerprint(&site, &Invocation::new());
    assert_eq!(fingerprint.key, "com.shop.OrderService.place");
    assert_eq!(fingerprint.display_name, "OrderService.place");
}

#[test]
fn test_invalid_template_falls_back_to_literal() {
    let (_bus, interceptor) = interceptor();
    let site = CallSite::new("T", "m").with_name("broken#{");
    let fingerprint = interceptor.fingerprint(&site, &Invocation::new());
    assert_eq!(fingerprint.key, "broken#{");
}

#[test]
fn test_blocking_profile_counts_success_and_failure() {
    let (bus, interceptor) = interceptor();
    let site = CallSite::new("com.shop.Payments", "charge")
        .with_business_error::<InsufficientFunds>();
    let invocation = Invocation::new();

    let ok: Result<u32, InsufficientFunds> =
        interceptor.profile_blocking(&site, &invocation, || Ok(1));
    assert_eq!(ok.unwrap(), 1);
    let err: Result<u32, InsufficientFunds> =
        interceptor.profile_blocking(&site, &invocation, || Err(InsufficientFunds));
    assert!(err.is_err());
    let io: Result<u32, std::io::Error> = interceptor.profile_blocking(&site, &invocation, || {
        Err(std::io::Error::other("down"))
    });
    assert!(io.is_err());

    let stats = interceptor
        .service_statistics("com.shop.Payments.charge")
        .unwrap();
    assert_eq!(stats.invocation_count(), 3);
    assert_eq!(stats.error_count(ErrorClass::Business), 1);
    assert_eq!(stats.error_count(ErrorClass::Communication), 1);
    assert_eq!(stats.error_count(ErrorClass::Other), 0);
    assert_eq!(stats.current_active(), 0);

    let name = stats.object_name();
    assert_eq!(name.to_string(), "warden:type=ServiceStatistics,name=c.s.Payments.charge");
    assert_eq!(
        bus.get_attribute(&name, "InvocationCount").unwrap(),
        AttributeValue::Integer(3)
    );
}

#[tokio::test]
async fn test_async_profile_tracks_current_active() {
    let (_bus, interceptor) = interceptor();
    let interceptor = Arc::new(interceptor);
    let site = CallSite::new("svc", "wait");
    let (release, wait) = tokio::sync::oneshot::channel::<()>();

    let running = {
        let interceptor = Arc::clone(&interceptor);
        let site = site.clone();
        tokio::spawn(async move {
            interceptor
                .profile(&site, &Invocation::new(), async {
                    let _ = wait.await;
                    Ok::<_, std::io::Error>(())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = interceptor.service_statistics("svc.wait").unwrap();
    assert_eq!(stats.current_active(), 1);

    release.send(()).unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(stats.current_active(), 0);
    assert_eq!(stats.invocation_count(), 1);
}

#[test]
fn test_threshold_boundaries_are_inclusive() {
    let site = CallSite::new("T", "m")
        .with_slow_threshold(Duration::from_millis(50))
        .with_very_slow_threshold(Duration::from_millis(100));
    let stats = ServiceStatistics::new(
        "T.m",
        crate::management::ObjectName::typed("d", "ServiceStatistics", Some("T.m")),
        &site,
    );

    stats.record_invocation(Duration::from_millis(49));
    stats.record_invocation(Duration::from_millis(50));
    stats.record_invocation(Duration::from_millis(99));
    stats.record_invocation(Duration::from_millis(100));

    assert_eq!(stats.slow_invocation_count(), 2);
    assert_eq!(stats.very_slow_invocation_count(), 1);
    assert_eq!(stats.invocation_count(), 4);
}

#[test]
fn test_thresholds_writable_on_bus() {
    let (bus, interceptor) = interceptor();
    let site = CallSite::new("T", "m");
    let stats = interceptor.statistics_for(&site, &Invocation::new());
    let name = stats.object_name();

    bus.set_attribute(&name, "SlowInvocationThresholdInMillis", 10i64.into())
        .unwrap();
    assert_eq!(stats.slow_threshold(), Duration::from_millis(10));
    assert!(bus
        .set_attribute(&name, "VerySlowInvocationThresholdInMillis", (-1i64).into())
        .is_err());
    assert!(bus
        .set_attribute(&name, "InvocationCount", 0i64.into())
        .is_err());
    assert_eq!(
        bus.get_attribute(&name, "MaxActive").unwrap(),
        AttributeValue::Integer(-1)
    );
}

#[test]
fn test_concurrent_first_invocations_publish_once() {
    let (bus, interceptor) = interceptor();
    let interceptor = Arc::new(interceptor);
    let site = CallSite::new("T", "hot").with_name("hot(#{args[0]})");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let interceptor = Arc::clone(&interceptor);
            let site = site.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let invocation = Invocation::new().arg("x");
                    let _: Result<(), std::io::Error> =
                        interceptor.profile_blocking(&site, &invocation, || Ok(()));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(interceptor.registered_count(), 1);
    assert_eq!(bus.len(), 1);
    assert_eq!(
        interceptor.service_statistics("hot(x)").unwrap().invocation_count(),
        400
    );
}

#[test]
fn test_interceptor_publishes_itself() {
    let (bus, interceptor) = interceptor();
    let interceptor = Arc::new(interceptor.with_domain("perf").with_name("main"));
    let name = interceptor.register().unwrap();
    assert_eq!(name.to_string(), "perf:type=ProfileInterceptor,name=main");

    let shop = Shop {
        country_code: "FR".into(),
    };
    let site = CallSite::of::<Shop>("open").with_name("open(#{invokedObject.countryCode})");
    let _: Result<(), std::io::Error> = interceptor.profile_blocking(
        &site,
        &Invocation::new().invoked_object(&shop),
        || Ok(()),
    );
    assert_eq!(
        bus.get_attribute(&name, "RegisteredServiceStatisticsCount")
            .unwrap(),
        AttributeValue::Integer(1)
    );
    assert!(interceptor.service_statistics("open(FR)").is_some());
}
