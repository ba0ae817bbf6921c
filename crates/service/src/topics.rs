//! Topic layout. `prefix` is the configured topic root and may be empty.

use fleet_bus::join;

/// Topic carrying the retained state envelope of `service`.
#[must_use]
pub fn state_topic(prefix: &str, service: &str) -> String {
    join([prefix, service])
}

/// Topic `service` receives `kind` requests on.
#[must_use]
pub fn request_topic(prefix: &str, service: &str, kind: &str) -> String {
    join([prefix, service, "request", kind])
}

/// Topic the response to request `uuid` is published on.
#[must_use]
pub fn response_topic(prefix: &str, service: &str, kind: &str, uuid: &str) -> String {
    join([prefix, service, "request", kind, uuid])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_without_prefix() {
        assert_eq!(state_topic("", "diskd"), "diskd");
        assert_eq!(request_topic("", "diskd", "ping"), "diskd/request/ping");
        assert_eq!(
            response_topic("", "diskd", "ping", "abc"),
            "diskd/request/ping/abc"
        );
    }

    #[test]
    fn test_layout_with_prefix() {
        assert_eq!(state_topic("fleet", "diskd"), "fleet/diskd");
        assert_eq!(
            response_topic("fleet", "diskd", "ping", "abc"),
            "fleet/diskd/request/ping/abc"
        );
    }
}
