pub const TOPIC_COMMANDS: &str = "/IOT3/COMMANDS";
pub const TOPIC_STATES: &str = "/IOT3/STATES";

/// Published once on the states topic after the broker session is up.
pub const STATE_DEVICE_READY: &str = "READY";

/// Commands addressed to every device on the broker.
pub fn home_topic(topic: &str) -> String {
    topic.to_string()
}

/// Commands addressed to this device only.
pub fn object_topic(topic: &str, device_ip: &str) -> String {
    format!("{topic}/{device_ip}")
}
