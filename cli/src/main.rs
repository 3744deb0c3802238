//! Edgewarden Control CLI
//!
//! Command-line interface for the node agent's local management API.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use edgewarden_protocol::{CircuitBreaker, Protocol, User};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "edgewardenctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, env = "EDGEWARDEN_API", default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Node API key
    #[arg(long, env = "NODE_API_KEY", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage local users
    Users {
        #[command(subcommand)]
        cmd: UserCommands,
    },
    /// Inspect or toggle the circuit breaker
    Breaker {
        #[command(subcommand)]
        cmd: BreakerCommands,
    },
    /// Per-user traffic
    Stats,
    /// Node connection parameters
    Config,
    /// Agent and proxy health
    Health,
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    /// List users
    List,
    /// Show one user with share links
    Show { uuid: Uuid },
    /// Create a new user
    Create {
        name: String,
        /// Comma separated, e.g. vless,shadowsocks
        #[arg(long, value_delimiter = ',')]
        protocols: Vec<Protocol>,
        /// Quota in GiB, 0 = unlimited
        #[arg(long, default_value_t = 0)]
        limit_gb: u64,
        /// Days until expiry, 0 = never
        #[arg(long, default_value_t = 0)]
        expire_days: u32,
    },
    /// Change a user
    Update {
        uuid: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        limit_gb: Option<u64>,
        /// 0 clears the expiry
        #[arg(long)]
        expire_days: Option<u32>,
    },
    Enable { uuid: Uuid },
    Disable { uuid: Uuid },
    Delete { uuid: Uuid },
}

#[derive(Subcommand, Debug)]
enum BreakerCommands {
    Status,
    /// Engage: all users are excluded from the proxy configuration
    On {
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        message: Option<String>,
    },
    Off,
}

#[derive(Debug, Serialize)]
struct CreateUserRequest {
    name: String,
    protocols: Vec<Protocol>,
    traffic_limit: u64,
    expire_days: u32,
}

#[derive(Debug, Default, Serialize)]
struct UpdateUserRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    traffic_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expire_days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct BreakerRequest {
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserDetail {
    #[serde(flatten)]
    user: User,
    #[serde(default)]
    vless_url: Option<String>,
    #[serde(default)]
    ss_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserList {
    total: usize,
    users: Vec<UserDetail>,
}

#[derive(Debug, Deserialize)]
struct StatsEntry {
    uuid: Uuid,
    name: String,
    enabled: bool,
    traffic_used: u64,
    traffic_limit: u64,
    session_traffic: u64,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    stats: Vec<StatsEntry>,
    monitored_users: usize,
    circuit_breaker: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Tabled)]
struct UserRow {
    uuid: Uuid,
    name: String,
    enabled: bool,
    protocols: String,
    used: String,
    limit: String,
    expires: String,
}

impl From<&User> for UserRow {
    fn from(u: &User) -> Self {
        Self {
            uuid: u.uuid,
            name: u.name.clone(),
            enabled: u.enabled,
            protocols: u
                .protocols
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(","),
            used: format_bytes(u.traffic_used),
            limit: format_limit(u.traffic_limit),
            expires: u
                .expire_at
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "never".into()),
        }
    }
}

#[derive(Tabled)]
struct StatsRow {
    uuid: Uuid,
    name: String,
    enabled: bool,
    used: String,
    limit: String,
    session: String,
}

impl From<&StatsEntry> for StatsRow {
    fn from(s: &StatsEntry) -> Self {
        Self {
            uuid: s.uuid,
            name: s.name.clone(),
            enabled: s.enabled,
            used: format_bytes(s.traffic_used),
            limit: format_limit(s.traffic_limit),
            session: format_bytes(s.session_traffic),
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn format_limit(bytes: u64) -> String {
    if bytes == 0 {
        "unlimited".into()
    } else {
        format_bytes(bytes)
    }
}

struct Api {
    client: Client,
    base: String,
    token: Option<String>,
}

impl Api {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.client.request(method, format!("{}{}", self.base, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|e| e.message)
                .unwrap_or(text);
            bail!("{}: {}", status, message);
        }
        Ok(resp.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn update(&self, uuid: Uuid, req: &UpdateUserRequest) -> Result<UserDetail> {
        let path = format!("/api/local/users/{uuid}");
        self.send(self.request(Method::PUT, &path).json(req)).await
    }

    async fn set_enabled(&self, uuid: Uuid, enabled: bool) -> Result<()> {
        let req = UpdateUserRequest {
            enabled: Some(enabled),
            ..Default::default()
        };
        self.update(uuid, &req).await?;
        println!("User {} {}", uuid, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }
}

fn print_user(detail: &UserDetail) {
    let table = tabled::Table::new([UserRow::from(&detail.user)]).to_string();
    println!("{}", table);
    if let Some(url) = &detail.vless_url {
        println!("vless: {}", url);
    }
    if let Some(url) = &detail.ss_url {
        println!("ss:    {}", url);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let api = Api {
        client: Client::new(),
        base: args.api.trim_end_matches('/').to_string(),
        token: args.token,
    };

    match args.command {
        Commands::Users { cmd } => match cmd {
            UserCommands::List => {
                let list: UserList = api.get("/api/local/users").await?;
                let rows: Vec<UserRow> = list.users.iter().map(|d| UserRow::from(&d.user)).collect();
                println!("{}", tabled::Table::new(rows));
                println!("{} users", list.total);
            }
            UserCommands::Show { uuid } => {
                let detail: UserDetail = api.get(&format!("/api/local/users/{uuid}")).await?;
                print_user(&detail);
            }
            UserCommands::Create {
                name,
                protocols,
                limit_gb,
                expire_days,
            } => {
                let req = CreateUserRequest {
                    name,
                    protocols,
                    traffic_limit: limit_gb.saturating_mul(GIB),
                    expire_days,
                };
                let detail: UserDetail = api
                    .send(api.request(Method::POST, "/api/local/users").json(&req))
                    .await?;
                println!("User created successfully");
                print_user(&detail);
            }
            UserCommands::Update {
                uuid,
                name,
                limit_gb,
                expire_days,
            } => {
                let req = UpdateUserRequest {
                    name,
                    traffic_limit: limit_gb.map(|gb| gb.saturating_mul(GIB)),
                    expire_days,
                    ..Default::default()
                };
                print_user(&api.update(uuid, &req).await?);
            }
            UserCommands::Enable { uuid } => api.set_enabled(uuid, true).await?,
            UserCommands::Disable { uuid } => api.set_enabled(uuid, false).await?,
            UserCommands::Delete { uuid } => {
                let path = format!("/api/local/users/{uuid}");
                let _: serde_json::Value = api.send(api.request(Method::DELETE, &path)).await?;
                println!("User deleted successfully");
            }
        },
        Commands::Breaker { cmd } => {
            let req = match cmd {
                BreakerCommands::Status => None,
                BreakerCommands::On { reason, message } => Some(BreakerRequest {
                    enabled: true,
                    reason,
                    message,
                }),
                BreakerCommands::Off => Some(BreakerRequest {
                    enabled: false,
                    reason: None,
                    message: None,
                }),
            };
            if let Some(req) = req {
                let _: serde_json::Value = api
                    .send(api.request(Method::POST, "/api/local/circuit-breaker").json(&req))
                    .await?;
            }
            let breaker: CircuitBreaker = api.get("/api/local/circuit-breaker").await?;
            if breaker.enabled {
                println!("Circuit breaker ENGAGED ({})", breaker.reason);
                if let Some(message) = breaker.message {
                    println!("{}", message);
                }
            } else {
                println!("Circuit breaker off");
            }
        }
        Commands::Stats => {
            let stats: StatsResponse = api.get("/api/local/stats").await?;
            let rows: Vec<StatsRow> = stats.stats.iter().map(StatsRow::from).collect();
            println!("{}", tabled::Table::new(rows));
            println!(
                "monitored: {}, circuit breaker: {}",
                stats.monitored_users,
                if stats.circuit_breaker { "on" } else { "off" }
            );
        }
        Commands::Config => {
            let config: serde_json::Value = api.get("/api/local/config").await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Health => {
            let resp = api.request(Method::GET, "/health").send().await?;
            let status = resp.status();
            let body: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            if !status.is_success() {
                bail!("agent unhealthy ({})", status);
            }
        }
    }

    Ok(())
}
