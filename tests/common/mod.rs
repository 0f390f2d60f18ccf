//! Shared fixtures for integration tests.

use instavpn::InstavpnConfig;

/// Configuration pointing the client at `base_url` with instant polling.
#[must_use]
pub fn config_for(base_url: &str) -> InstavpnConfig {
    InstavpnConfig {
        api_key: String::from("api-secret"),
        client_id: String::from("client-1"),
        api_base_url: base_url.to_owned(),
        default_region: String::from("nyc1"),
        default_size: String::from("2"),
        default_image: String::from("ubuntu-20"),
        default_name: String::from("instavpn"),
        ssh_key_ids: Some(String::from("5")),
        max_retries: 5,
        initial_delay_secs: 0,
        poll_interval_secs: 0,
        self_destruct: true,
        self_destruct_timeout_secs: 120,
        scrub: false,
        destroy_on_exit: true,
        self_destruct_template: None,
        watch_pattern: String::from("assembler.py"),
    }
}

/// Status body for machine `id`.
#[must_use]
pub fn status_body(id: u64, status: &str, ip: Option<&str>) -> String {
    let address = ip.map_or_else(|| String::from("null"), |ip| format!("\"{ip}\""));
    format!(
        r#"{{"status":"OK","droplet":{{"id":{id},"name":"instavpn","ip_address":{address},"status":"{status}","created_at":"2013-01-01T09:30:00Z"}}}}"#
    )
}
