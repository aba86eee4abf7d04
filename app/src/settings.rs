//! Compile-time configuration loaded via `toml-cfg`.

#[toml_cfg::toml_config]
pub struct Settings {
    #[default("sip:alice@example.com")]
    pub aor: &'static str,
    #[default("sip:alice@127.0.0.1:5060")]
    pub contact: &'static str,
    #[default("sip:bob@example.com")]
    pub presentity: &'static str,
    #[default("presence")]
    pub event: &'static str,
    #[default(3600)]
    pub subscription_expires: u32,
    #[default(3600)]
    pub publication_expires: u32,
    // Upper bound the loopback compositor grants
    #[default(600)]
    pub granted_expires: u32,
    #[default(60)]
    pub min_expires: u32,
    #[default("open")]
    pub initial_status: &'static str,
    #[default("closed")]
    pub final_status: &'static str,
}
