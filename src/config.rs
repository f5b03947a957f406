use std::path::PathBuf;

use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Defaults are suitable for local development; production deployments MUST
/// override at least `ADMIN_KEY` and the announced address.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address the media engine binds RTP/ICE sockets to.
    pub listen_ip: String,
    /// Address advertised in ICE candidates (public IP behind NAT/Docker).
    pub announced_ip: String,
    /// HTTP listener port.
    pub port: u16,
    /// HTTPS listener port (active only when the TLS paths are set).
    pub https_port: u16,

    // ── TLS ─────────────────────────────────────────────────────────────
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    // ── Media engine port range ─────────────────────────────────────────
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    // ── Fork port ranges (disjoint, one arena per sink kind) ───────────
    pub recording_rtp_port_min: u16,
    pub recording_rtp_port_max: u16,
    pub transcription_rtp_port_min: u16,
    pub transcription_rtp_port_max: u16,

    // ── Storage ─────────────────────────────────────────────────────────
    pub db_path: PathBuf,
    /// Path to the sqlite-vec loadable extension. When unset the vector
    /// index runs on the in-process fallback backend.
    pub sqlite_vec_path: Option<PathBuf>,
    pub recording_dir: PathBuf,

    // ── Transcription ───────────────────────────────────────────────────
    pub transcription_enabled: bool,
    pub whisper_model_dir: PathBuf,
    pub whisper_model_size: String,

    // ── Embeddings ──────────────────────────────────────────────────────
    pub embedding_enabled: bool,

    // ── Tenancy ─────────────────────────────────────────────────────────
    /// Bootstrap a default tenant + a local room named `main` at startup.
    pub single_tenant: bool,
    /// API key of the bootstrap tenant (generated when unset).
    pub admin_key: String,

    // ── CORS / logging ──────────────────────────────────────────────────
    pub allowed_origins: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let admin_key = match std::env::var("ADMIN_KEY") {
            Ok(k) if !k.is_empty() => k,
            _ => {
                let key = uuid::Uuid::new_v4().to_string();
                warn!("ADMIN_KEY not set — using random value (not suitable for production)");
                key
            }
        };

        let config = Config {
            listen_ip: env_or("LISTEN_IP", "0.0.0.0"),
            announced_ip: env_or("ANNOUNCED_IP", "127.0.0.1"),
            port: env_u16("PORT", 3000),
            https_port: env_u16("HTTPS_PORT", 3443),
            tls_cert_path: std::env::var("TLS_CERT_PATH").ok().filter(|s| !s.is_empty()),
            tls_key_path: std::env::var("TLS_KEY_PATH").ok().filter(|s| !s.is_empty()),
            rtc_min_port: env_u16("RTC_MIN_PORT", 40000),
            rtc_max_port: env_u16("RTC_MAX_PORT", 49999),
            recording_rtp_port_min: env_u16("RECORDING_RTP_PORT_MIN", 50000),
            recording_rtp_port_max: env_u16("RECORDING_RTP_PORT_MAX", 50999),
            transcription_rtp_port_min: env_u16("TRANSCRIPTION_RTP_PORT_MIN", 51000),
            transcription_rtp_port_max: env_u16("TRANSCRIPTION_RTP_PORT_MAX", 51999),
            db_path: PathBuf::from(env_or("DB_PATH", "./soundcast.db")),
            sqlite_vec_path: std::env::var("SQLITE_VEC_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            recording_dir: PathBuf::from(env_or("RECORDING_DIR", "./recordings")),
            transcription_enabled: env_bool("TRANSCRIPTION_ENABLED", false),
            whisper_model_dir: PathBuf::from(env_or("WHISPER_MODEL_DIR", "./models")),
            whisper_model_size: env_or("WHISPER_MODEL_SIZE", "base"),
            embedding_enabled: env_bool("EMBEDDING_ENABLED", false),
            single_tenant: env_bool("SINGLE_TENANT", false),
            admin_key,
            allowed_origins: env_or("ALLOWED_ORIGINS", "*"),
            log_level: env_or("LOG_LEVEL", "info"),
        };

        config.log_summary();
        config
    }

    /// TLS is active only when both PEM paths are configured.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }

    pub fn recording_port_range(&self) -> (u16, u16) {
        (self.recording_rtp_port_min, self.recording_rtp_port_max)
    }

    pub fn transcription_port_range(&self) -> (u16, u16) {
        (self.transcription_rtp_port_min, self.transcription_rtp_port_max)
    }

    fn log_summary(&self) {
        info!("──── Soundcast Configuration ────");
        info!("  listen_ip          : {}", self.listen_ip);
        info!("  announced_ip       : {}", self.announced_ip);
        info!("  port               : {}", self.port);
        if self.tls_enabled() {
            info!("  https_port         : {}", self.https_port);
        }
        info!("  rtc_ports          : {}-{}", self.rtc_min_port, self.rtc_max_port);
        info!(
            "  recording_ports    : {}-{}",
            self.recording_rtp_port_min, self.recording_rtp_port_max
        );
        info!(
            "  transcription_ports: {}-{}",
            self.transcription_rtp_port_min, self.transcription_rtp_port_max
        );
        info!("  db_path            : {}", self.db_path.display());
        info!(
            "  sqlite_vec         : {}",
            self.sqlite_vec_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(in-process fallback)".into())
        );
        info!("  recording_dir      : {}", self.recording_dir.display());
        info!("  transcription      : {}", self.transcription_enabled);
        if self.transcription_enabled {
            info!("  whisper_model_dir  : {}", self.whisper_model_dir.display());
            info!("  whisper_model_size : {}", self.whisper_model_size);
        }
        info!("  embeddings         : {}", self.embedding_enabled);
        info!("  single_tenant      : {}", self.single_tenant);
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("─────────────────────────────────");
    }
}

impl Default for Config {
    /// Test-friendly defaults that never read the environment.
    fn default() -> Self {
        Config {
            listen_ip: "127.0.0.1".into(),
            announced_ip: "127.0.0.1".into(),
            port: 3000,
            https_port: 3443,
            tls_cert_path: None,
            tls_key_path: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            recording_rtp_port_min: 50000,
            recording_rtp_port_max: 50999,
            transcription_rtp_port_min: 51000,
            transcription_rtp_port_max: 51999,
            db_path: PathBuf::from(":memory:"),
            sqlite_vec_path: None,
            recording_dir: PathBuf::from("./recordings"),
            transcription_enabled: false,
            whisper_model_dir: PathBuf::from("./models"),
            whisper_model_size: "base".into(),
            embedding_enabled: false,
            single_tenant: false,
            admin_key: "test-admin-key".into(),
            allowed_origins: "*".into(),
            log_level: "info".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
