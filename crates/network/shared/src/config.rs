//! Gemeinsame Konfigurationsstrukturen für Handshake und Pipeline.
//!
//! Everything has a `Default` so an empty TOML file is a valid configuration.
//! Per-connection tuning lives in `profiles`, keyed by connection name.

use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messaging::frames::{CompressionKind, EncryptionKind};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("pre-shared key: {0}")]
    Key(String),
}

fn invalid(key: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Handshake-Parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeSettings {
    pub timeout_ms: u64,
    pub max_frame_bytes: u32,
    pub supported_versions: Vec<u16>,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_frame_bytes: 16 * 1024,
            supported_versions: crate::SUPPORTED_VERSIONS.to_vec(),
        }
    }
}

impl HandshakeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Framing der Protokoll-Stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Version byte written into every frame header.
    pub version: u8,
    /// Largest application payload accepted by `send_outgoing`.
    pub max_payload_bytes: u32,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            version: 1,
            max_payload_bytes: 256 * 1024,
        }
    }
}

/// Kompressions-Präferenzen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    /// Offered / accepted codecs, most preferred first.
    pub preferred: Vec<CompressionKind>,
    /// Payloads below this size are stored uncompressed.
    pub min_size: usize,
    /// DEFLATE level (0-9).
    pub level: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            preferred: vec![CompressionKind::Deflate, CompressionKind::None],
            min_size: 128,
            level: 6,
        }
    }
}

/// Verschlüsselungs-Präferenzen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    /// Offered / accepted codecs, most preferred first.
    pub preferred: Vec<EncryptionKind>,
    /// 32-byte key, hex encoded. Without a key only `none` is negotiable.
    pub pre_shared_key: Option<String>,
    /// Messages sealed under one key before the codec refuses to continue.
    pub max_messages_per_key: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            preferred: vec![EncryptionKind::XChaCha20Poly1305, EncryptionKind::None],
            pre_shared_key: None,
            max_messages_per_key: 1 << 32,
        }
    }
}

impl EncryptionSettings {
    /// Decodes the configured key, if any.
    pub fn key_bytes(&self) -> Result<Option<[u8; 32]>, SettingsError> {
        let Some(encoded) = self.pre_shared_key.as_deref() else {
            return Ok(None);
        };
        let raw = hex::decode(encoded.trim()).map_err(|e| SettingsError::Key(e.to_string()))?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| SettingsError::Key(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Some(key))
    }

    /// Codecs that can actually be used with the current key material.
    pub fn usable(&self) -> Vec<EncryptionKind> {
        let has_key = matches!(self.key_bytes(), Ok(Some(_)));
        self.preferred
            .iter()
            .copied()
            .filter(|kind| *kind == EncryptionKind::None || has_key)
            .collect()
    }
}

/// Messfenster und Schwellwerte der Qualitäts-Stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    /// Ticks covered by the rolling loss estimate.
    pub window_ticks: usize,
    /// Loss rate at or above which the link counts as degraded.
    pub degraded_loss: f64,
    /// Loss rate at or above which the link counts as bad.
    pub bad_loss: f64,
    /// Smoothed RTT above which the link counts as degraded.
    pub degraded_rtt_ms: u64,
    /// Smoothed RTT above which the link counts as bad.
    pub bad_rtt_ms: u64,
    /// Outstanding probe timestamps kept for RTT matching. Must be positive;
    /// without a kept timestamp no echo can produce an RTT sample.
    pub max_outstanding_probes: usize,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            window_ticks: 32,
            degraded_loss: 0.05,
            bad_loss: 0.20,
            degraded_rtt_ms: 150,
            bad_rtt_ms: 400,
            max_outstanding_probes: 256,
        }
    }
}

/// Fenster- und Warteschlangen-Parameter der Flusskontrolle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlSettings {
    /// Window (messages per tick) at connection start.
    pub initial_window: f64,
    pub min_window: f64,
    pub max_window: f64,
    /// Below this window the stage leaves `Open`.
    pub open_threshold: f64,
    /// Window growth per healthy tick.
    pub additive_increase: f64,
    /// Window factor applied on a congested tick.
    pub multiplicative_decrease: f64,
    /// Loss rate that counts as a congestion signal.
    pub loss_limit: f64,
    /// Smoothed RTT that counts as a congestion signal.
    pub rtt_limit_ms: u64,
    /// Maximum number of queued messages.
    pub queue_bound: usize,
}

impl Default for FlowControlSettings {
    fn default() -> Self {
        Self {
            initial_window: 32.0,
            min_window: 1.0,
            max_window: 256.0,
            open_threshold: 4.0,
            additive_increase: 2.0,
            multiplicative_decrease: 0.5,
            loss_limit: 0.10,
            rtt_limit_ms: 300,
            queue_bound: 64,
        }
    }
}

/// Puffer-Pool pro Pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Capacity classes in ascending order.
    pub size_classes: Vec<usize>,
    /// Idle buffers kept per class.
    pub retained_per_class: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size_classes: vec![256, 1024, 4096, 16 * 1024, 64 * 1024],
            retained_per_class: 16,
        }
    }
}

/// Verbindungsspezifische Überschreibungen (Schlüssel: Verbindungsname).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningProfile {
    pub quality: Option<QualitySettings>,
    pub flow_control: Option<FlowControlSettings>,
}

/// Gesamte Netzwerk-Konfiguration einer Pipeline-Instanz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub handshake: HandshakeSettings,
    pub protocol: ProtocolSettings,
    pub compression: CompressionSettings,
    pub encryption: EncryptionSettings,
    pub quality: QualitySettings,
    pub flow_control: FlowControlSettings,
    pub pool: PoolSettings,
    /// Decode failures in a row that escalate a connection to `Closing`.
    pub max_consecutive_decode_failures: u32,
    pub profiles: BTreeMap<String, TuningProfile>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            handshake: HandshakeSettings::default(),
            protocol: ProtocolSettings::default(),
            compression: CompressionSettings::default(),
            encryption: EncryptionSettings::default(),
            quality: QualitySettings::default(),
            flow_control: FlowControlSettings::default(),
            pool: PoolSettings::default(),
            max_consecutive_decode_failures: 3,
            profiles: BTreeMap::new(),
        }
    }
}

impl NetworkSettings {
    /// Parses and validates settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads, parses and validates a settings file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read network settings {}", path.display()))?;
        let settings = Self::from_toml_str(&text)
            .with_context(|| format!("invalid network settings {}", path.display()))?;
        tracing::debug!(target: "net::config", path = %path.display(), "network settings loaded");
        Ok(settings)
    }

    /// Quality settings for a connection, honoring its tuning profile.
    pub fn quality_for(&self, connection_name: &str) -> &QualitySettings {
        self.profiles
            .get(connection_name)
            .and_then(|p| p.quality.as_ref())
            .unwrap_or(&self.quality)
    }

    /// Flow-control settings for a connection, honoring its tuning profile.
    pub fn flow_control_for(&self, connection_name: &str) -> &FlowControlSettings {
        self.profiles
            .get(connection_name)
            .and_then(|p| p.flow_control.as_ref())
            .unwrap_or(&self.flow_control)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.handshake.supported_versions.is_empty() {
            return Err(invalid("handshake.supported_versions", "must not be empty"));
        }
        if self.handshake.max_frame_bytes == 0 {
            return Err(invalid("handshake.max_frame_bytes", "must be positive"));
        }
        if self.protocol.max_payload_bytes == 0 {
            return Err(invalid("protocol.max_payload_bytes", "must be positive"));
        }
        if self.compression.preferred.is_empty() {
            return Err(invalid("compression.preferred", "must not be empty"));
        }
        if self.compression.level > 9 {
            return Err(invalid("compression.level", "must be within 0..=9"));
        }
        if self.encryption.preferred.is_empty() {
            return Err(invalid("encryption.preferred", "must not be empty"));
        }
        self.encryption.key_bytes()?;
        if self.max_consecutive_decode_failures == 0 {
            return Err(invalid("max_consecutive_decode_failures", "must be positive"));
        }

        let classes = &self.pool.size_classes;
        if classes.is_empty() || classes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid(
                "pool.size_classes",
                "must be non-empty and strictly ascending",
            ));
        }

        validate_quality(&self.quality)?;
        validate_flow(&self.flow_control)?;
        for profile in self.profiles.values() {
            if let Some(q) = &profile.quality {
                validate_quality(q)?;
            }
            if let Some(f) = &profile.flow_control {
                validate_flow(f)?;
            }
        }
        Ok(())
    }
}

fn validate_quality(q: &QualitySettings) -> Result<(), SettingsError> {
    if q.window_ticks == 0 {
        return Err(invalid("quality.window_ticks", "must be positive"));
    }
    if q.max_outstanding_probes == 0 {
        return Err(invalid("quality.max_outstanding_probes", "must be positive"));
    }
    if !(0.0..=1.0).contains(&q.degraded_loss) || !(0.0..=1.0).contains(&q.bad_loss) {
        return Err(invalid("quality.*_loss", "must be within 0.0..=1.0"));
    }
    if q.degraded_loss > q.bad_loss || q.degraded_rtt_ms > q.bad_rtt_ms {
        return Err(invalid("quality", "degraded thresholds must not exceed bad thresholds"));
    }
    Ok(())
}

fn validate_flow(f: &FlowControlSettings) -> Result<(), SettingsError> {
    if f.min_window < 1.0 || f.min_window > f.max_window {
        return Err(invalid("flow_control.min_window", "must be >= 1 and <= max_window"));
    }
    if !(f.min_window..=f.max_window).contains(&f.initial_window) {
        return Err(invalid("flow_control.initial_window", "must lie within min..=max"));
    }
    if !(f.multiplicative_decrease > 0.0 && f.multiplicative_decrease < 1.0) {
        return Err(invalid("flow_control.multiplicative_decrease", "must be within (0, 1)"));
    }
    if f.additive_increase <= 0.0 {
        return Err(invalid("flow_control.additive_increase", "must be positive"));
    }
    if f.queue_bound == 0 {
        return Err(invalid("flow_control.queue_bound", "must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        NetworkSettings::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(
            NetworkSettings::from_toml_str("").unwrap(),
            NetworkSettings::default()
        );
    }

    #[test]
    fn profile_overrides_flow_control() {
        let text = r#"
            [flow_control]
            queue_bound = 10

            [profiles.lobby.flow_control]
            queue_bound = 3
            initial_window = 2.0
        "#;
        let settings = NetworkSettings::from_toml_str(text).unwrap();
        assert_eq!(settings.flow_control_for("lobby").queue_bound, 3);
        assert_eq!(settings.flow_control_for("world").queue_bound, 10);
        assert_eq!(
            settings.quality_for("lobby").window_ticks,
            QualitySettings::default().window_ticks
        );
    }

    #[test]
    fn codec_names_parse() {
        let text = r#"
            [compression]
            preferred = ["none"]

            [encryption]
            preferred = ["xchacha20poly1305", "none"]
        "#;
        let settings = NetworkSettings::from_toml_str(text).unwrap();
        assert_eq!(settings.compression.preferred, vec![CompressionKind::None]);
        assert_eq!(
            settings.encryption.preferred,
            vec![EncryptionKind::XChaCha20Poly1305, EncryptionKind::None]
        );
        // No key configured: only pass-through is usable.
        assert_eq!(settings.encryption.usable(), vec![EncryptionKind::None]);
    }

    #[test]
    fn key_must_be_32_bytes() {
        let mut settings = NetworkSettings::default();
        settings.encryption.pre_shared_key = Some("abcd".into());
        assert!(matches!(settings.validate(), Err(SettingsError::Key(_))));

        settings.encryption.pre_shared_key = Some("11".repeat(32));
        settings.validate().unwrap();
        assert_eq!(settings.encryption.key_bytes().unwrap(), Some([0x11; 32]));
        assert_eq!(settings.encryption.usable().len(), 2);
    }

    #[test]
    fn rejects_inconsistent_windows() {
        let mut settings = NetworkSettings::default();
        settings.flow_control.min_window = 8.0;
        settings.flow_control.max_window = 4.0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { key: "flow_control.min_window", .. })
        ));
    }

    #[test]
    fn rejects_zero_outstanding_probes() {
        let text = r#"
            [profiles.lobby.quality]
            max_outstanding_probes = 0
        "#;
        let settings = NetworkSettings::from_toml_str(text).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { key: "quality.max_outstanding_probes", .. })
        ));
    }

    #[test]
    fn rejects_unsorted_pool_classes() {
        let mut settings = NetworkSettings::default();
        settings.pool.size_classes = vec![1024, 256];
        assert!(settings.validate().is_err());
    }
}
