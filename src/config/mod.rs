use std::env;

/// How the extension filter list is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// No filtering.
    None,
    /// Extensions in the list are rejected.
    Blacklist,
    /// Only extensions in the list are accepted.
    Whitelist,
}

impl FilterMode {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "blacklist" => FilterMode::Blacklist,
            "whitelist" => FilterMode::Whitelist,
            _ => FilterMode::None,
        }
    }
}

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // -- Server --
    /// Listen port (default: 9999)
    pub port: u16,
    /// Public base URL for file links (default: "http://localhost:9999")
    pub domain: String,
    /// Base URL of the landing page, if different from `domain`
    pub home_domain: Option<String>,
    /// Honor X-Forwarded-For for the client IP (default: false)
    pub trust_proxy: bool,
    /// Serve committed uploads from this process (default: true)
    pub serve_files_with_node: bool,
    /// Require a valid token for uploading (default: false)
    pub private: bool,
    /// Allow self-registration (default: true)
    pub enable_user_accounts: bool,
    /// Allowed CORS origins, comma separated
    pub allowed_origins: Vec<String>,

    // -- Storage --
    /// SQLite connection string (default: "sqlite://database/db.sqlite3?mode=rwc")
    pub database_url: String,
    /// Root directory for uploads, chunks, thumbs and zips (default: "uploads")
    pub uploads_root: String,

    // -- Uploads --
    /// Per-file byte cap (default: 512 MiB)
    pub max_size: u64,
    /// Reject zero-byte uploads (default: true)
    pub filter_empty_file: bool,
    /// Hash uploads with BLAKE3 and deduplicate (default: true)
    pub hashing: bool,
    /// Store the uploader IP on file rows (default: true)
    pub store_ip: bool,
    /// Default public identifier length for files
    pub file_identifier_length: usize,
    /// Bounds for the client-requested `filelength` header
    pub file_identifier_min: usize,
    pub file_identifier_max: usize,
    /// Identifier length for albums
    pub album_identifier_length: usize,
    /// Attempts before identifier allocation gives up
    pub id_max_tries: u32,
    /// Probe identifier uniqueness against the uploads directory instead of
    /// the database. The database probe catches identifiers shared across
    /// extensions and is the recommended default.
    pub id_filesystem_probe: bool,
    /// Extension filter mode plus list (extensions carry the leading dot)
    pub extension_filter_mode: FilterMode,
    pub extension_filter: Vec<String>,
    /// Maximum files per multipart request
    pub max_files_per_upload: usize,
    /// Maximum non-file fields per multipart request
    pub max_fields_per_upload: usize,
    /// Allow clients to request metadata stripping (default: true)
    pub strip_tags: bool,

    // -- Chunked uploads --
    /// Chunk size advertised to clients (default: 10 MiB)
    pub chunk_size: u64,
    /// Upper bound on chunks per session
    pub max_chunks: u32,
    /// Idle chunk sessions are reaped after this many seconds (default: 30 min)
    pub chunk_timeout_secs: u64,

    // -- URL uploads --
    pub url_uploads: bool,
    /// Byte cap for remote downloads (default: 32 MiB)
    pub url_max_size: u64,
    /// Combined HEAD+GET budget in seconds. Deliberately short so upstream
    /// proxies do not evict the idle socket mid-transfer.
    pub url_fetch_timeout_secs: u64,
    /// Optional proxy template; `{url}` and `{url-noprot}` are substituted
    pub url_proxy: Option<String>,
    /// Separate extension filter for URL uploads; falls back to the main one
    pub url_extension_filter_mode: FilterMode,
    pub url_extension_filter: Vec<String>,

    // -- Virus scanning --
    pub scan_enabled: bool,
    pub clamav_host: String,
    pub clamav_port: u16,
    /// Files larger than this skip scanning (default: 256 MiB)
    pub scan_max_size: u64,
    /// Extensions that skip scanning
    pub scan_whitelist: Vec<String>,
    /// Users at or above this rank skip scanning
    pub scan_bypass_rank: i32,

    // -- Retention --
    /// Allowed expiry ages in hours for the base user group (0 = permanent)
    pub retention_user: Vec<f64>,
    /// Additional ages granted to moderators and above
    pub retention_moderator: Vec<f64>,
    /// Additional ages granted to admins and above
    pub retention_admin: Vec<f64>,

    // -- Albums / ZIP --
    /// Reject ZIP generation when member sizes sum over this (default: 512 MiB)
    pub zip_max_total_size: u64,

    // -- Thumbnails --
    pub thumbnails: bool,

    // -- CDN cache purge (Cloudflare-compatible API) --
    pub cdn_purge: bool,
    pub cdn_zone_id: Option<String>,
    pub cdn_api_token: Option<String>,
    pub cdn_user_service_key: Option<String>,
    pub cdn_api_key: Option<String>,
    pub cdn_email: Option<String>,

    // -- Listing --
    /// Page size for file and album listings (default: 25)
    pub page_size: u64,

    // -- Sweeper --
    /// Seconds between retention sweeps (default: 60)
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9999,
            domain: "http://localhost:9999".to_string(),
            home_domain: None,
            trust_proxy: false,
            serve_files_with_node: true,
            private: false,
            enable_user_accounts: true,
            allowed_origins: vec!["*".to_string()],
            database_url: "sqlite://database/db.sqlite3?mode=rwc".to_string(),
            uploads_root: "uploads".to_string(),
            max_size: 512 * 1024 * 1024,
            filter_empty_file: true,
            hashing: true,
            store_ip: true,
            file_identifier_length: 8,
            file_identifier_min: 4,
            file_identifier_max: 32,
            album_identifier_length: 8,
            id_max_tries: 12,
            id_filesystem_probe: false,
            extension_filter_mode: FilterMode::Blacklist,
            extension_filter: [".exe", ".bat", ".cmd", ".msi", ".sh", ".jar", ".scr", ".ps1"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_files_per_upload: 20,
            max_fields_per_upload: 6,
            strip_tags: true,
            chunk_size: 10 * 1024 * 1024,
            max_chunks: 500,
            chunk_timeout_secs: 30 * 60,
            url_uploads: true,
            url_max_size: 32 * 1024 * 1024,
            url_fetch_timeout_secs: 10,
            url_proxy: None,
            url_extension_filter_mode: FilterMode::None,
            url_extension_filter: Vec::new(),
            scan_enabled: false,
            clamav_host: "127.0.0.1".to_string(),
            clamav_port: 3310,
            scan_max_size: 256 * 1024 * 1024,
            scan_whitelist: Vec::new(),
            scan_bypass_rank: crate::entities::users::permissions::MODERATOR,
            retention_user: vec![0.0, 1.0, 6.0, 12.0, 24.0, 48.0, 72.0, 168.0],
            retention_moderator: vec![336.0, 720.0],
            retention_admin: vec![],
            zip_max_total_size: 512 * 1024 * 1024,
            thumbnails: true,
            cdn_purge: false,
            cdn_zone_id: None,
            cdn_api_token: None,
            cdn_user_service_key: None,
            cdn_api_key: None,
            cdn_email: None,
            page_size: 25,
            sweep_interval_secs: 60,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| {
            let v = v.to_lowercase();
            v != "false" && v != "0" && v != "off"
        })
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or(default)
}

fn env_ages(key: &str, default: Vec<f64>) -> Vec<f64> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect()
        })
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();

        Self {
            port: env_parse("PORT", d.port),
            domain: env::var("DOMAIN").unwrap_or(d.domain),
            home_domain: env::var("HOME_DOMAIN").ok().filter(|v| !v.is_empty()),
            trust_proxy: env_bool("TRUST_PROXY", d.trust_proxy),
            serve_files_with_node: env_bool("SERVE_FILES_WITH_NODE", d.serve_files_with_node),
            private: env_bool("PRIVATE", d.private),
            enable_user_accounts: env_bool("ENABLE_USER_ACCOUNTS", d.enable_user_accounts),
            allowed_origins: env_list("ALLOWED_ORIGINS", d.allowed_origins),
            database_url: env::var("DATABASE_URL").unwrap_or(d.database_url),
            uploads_root: env::var("UPLOADS_ROOT").unwrap_or(d.uploads_root),
            max_size: env_parse("MAX_SIZE", d.max_size),
            filter_empty_file: env_bool("FILTER_EMPTY_FILE", d.filter_empty_file),
            hashing: env_bool("HASHING", d.hashing),
            store_ip: env_bool("STORE_IP", d.store_ip),
            file_identifier_length: env_parse("FILE_IDENTIFIER_LENGTH", d.file_identifier_length),
            file_identifier_min: env_parse("FILE_IDENTIFIER_MIN", d.file_identifier_min),
            file_identifier_max: env_parse("FILE_IDENTIFIER_MAX", d.file_identifier_max),
            album_identifier_length: env_parse(
                "ALBUM_IDENTIFIER_LENGTH",
                d.album_identifier_length,
            ),
            id_max_tries: env_parse("ID_MAX_TRIES", d.id_max_tries),
            id_filesystem_probe: env_bool("ID_FILESYSTEM_PROBE", d.id_filesystem_probe),
            extension_filter_mode: env::var("EXTENSION_FILTER_MODE")
                .map(|v| FilterMode::parse(&v))
                .unwrap_or(d.extension_filter_mode),
            extension_filter: env_list("EXTENSION_FILTER", d.extension_filter),
            max_files_per_upload: env_parse("MAX_FILES_PER_UPLOAD", d.max_files_per_upload),
            max_fields_per_upload: env_parse("MAX_FIELDS_PER_UPLOAD", d.max_fields_per_upload),
            strip_tags: env_bool("STRIP_TAGS", d.strip_tags),
            chunk_size: env_parse("CHUNK_SIZE", d.chunk_size),
            max_chunks: env_parse("MAX_CHUNKS", d.max_chunks),
            chunk_timeout_secs: env_parse("CHUNK_TIMEOUT_SECS", d.chunk_timeout_secs),
            url_uploads: env_bool("URL_UPLOADS", d.url_uploads),
            url_max_size: env_parse("URL_MAX_SIZE", d.url_max_size),
            url_fetch_timeout_secs: env_parse("URL_FETCH_TIMEOUT_SECS", d.url_fetch_timeout_secs),
            url_proxy: env::var("URL_PROXY").ok().filter(|v| !v.is_empty()),
            url_extension_filter_mode: env::var("URL_EXTENSION_FILTER_MODE")
                .map(|v| FilterMode::parse(&v))
                .unwrap_or(d.url_extension_filter_mode),
            url_extension_filter: env_list("URL_EXTENSION_FILTER", d.url_extension_filter),
            scan_enabled: env_bool("SCAN_ENABLED", d.scan_enabled),
            clamav_host: env::var("CLAMAV_HOST").unwrap_or(d.clamav_host),
            clamav_port: env_parse("CLAMAV_PORT", d.clamav_port),
            scan_max_size: env_parse("SCAN_MAX_SIZE", d.scan_max_size),
            scan_whitelist: env_list("SCAN_WHITELIST", d.scan_whitelist),
            scan_bypass_rank: env_parse("SCAN_BYPASS_RANK", d.scan_bypass_rank),
            retention_user: env_ages("RETENTION_USER", d.retention_user),
            retention_moderator: env_ages("RETENTION_MODERATOR", d.retention_moderator),
            retention_admin: env_ages("RETENTION_ADMIN", d.retention_admin),
            zip_max_total_size: env_parse("ZIP_MAX_TOTAL_SIZE", d.zip_max_total_size),
            thumbnails: env_bool("THUMBNAILS", d.thumbnails),
            cdn_purge: env_bool("CDN_PURGE", d.cdn_purge),
            cdn_zone_id: env::var("CDN_ZONE_ID").ok(),
            cdn_api_token: env::var("CDN_API_TOKEN").ok(),
            cdn_user_service_key: env::var("CDN_USER_SERVICE_KEY").ok(),
            cdn_api_key: env::var("CDN_API_KEY").ok(),
            cdn_email: env::var("CDN_EMAIL").ok(),
            page_size: env_parse("PAGE_SIZE", d.page_size),
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", d.sweep_interval_secs),
        }
    }

    /// Absolute URL a committed file is served from.
    pub fn file_url(&self, name: &str) -> String {
        format!("{}/{}", self.domain.trim_end_matches('/'), name)
    }

    /// Clamp a client-requested identifier length into the configured bounds.
    pub fn resolve_identifier_length(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(n) => n.clamp(self.file_identifier_min, self.file_identifier_max),
            None => self.file_identifier_length,
        }
    }
}
