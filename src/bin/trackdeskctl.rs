use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use trackdesk::domain::{RuleInput, TrafficEvent, TrafficEventInput, TrafficRule};
use trackdesk::service::{ProcessedTraffic, RuleTestResult};

#[derive(Parser)]
#[command(name = "trackdeskctl", about = "Control CLI for trackdesk", version)]
struct Cli {
    /// trackdesk API endpoint
    #[arg(short, long, default_value = "http://127.0.0.1:8080", env = "TRACKDESK_API")]
    api: String,

    /// Operator ID recorded in the audit log for rule changes
    #[arg(short, long, env = "USER")]
    operator: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status and health
    Status,

    /// Manage traffic rules
    #[command(subcommand)]
    Rules(RuleCommands),

    /// Inspect recorded traffic events
    #[command(subcommand)]
    Events(EventCommands),

    /// Preview a rule file against a sample event without saving it
    Test {
        /// Rule definition (YAML or JSON)
        rule: PathBuf,

        /// Sample event (YAML or JSON)
        event: PathBuf,
    },

    /// Submit one request for a decision
    Process {
        /// Client IP address
        #[arg(long)]
        ip: String,

        #[arg(long, default_value = "")]
        user_agent: String,

        #[arg(long)]
        affiliate: Option<String>,

        /// Edge-resolved country code
        #[arg(long)]
        country: Option<String>,

        /// Extra event payload as a JSON object
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    /// List rules in priority order
    List {
        /// Filter by status (active, inactive)
        #[arg(short, long)]
        status: Option<String>,

        /// Max results
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Show one rule
    Get { id: String },

    /// Create a rule from a YAML or JSON file
    Create { file: PathBuf },

    /// Replace a rule from a YAML or JSON file
    Update { id: String, file: PathBuf },

    /// Activate a rule
    Enable { id: String },

    /// Deactivate a rule
    Disable { id: String },

    /// Delete a rule
    Delete { id: String },
}

#[derive(Subcommand)]
enum EventCommands {
    /// List recent events, newest first
    List {
        /// Filter by outcome (e.g. IP_BLOCK)
        #[arg(long)]
        action: Option<String>,

        /// Filter by client IP
        #[arg(long)]
        ip: Option<String>,

        /// Filter by deciding rule ID
        #[arg(long)]
        rule: Option<String>,

        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Show one event
    Get { id: String },
}

// API response types
#[derive(Debug, Deserialize, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_rules: Option<u32>,
    storage: String,
    fail_policy: String,
}

#[derive(Debug, Deserialize)]
struct RulesListResponse {
    rules: Vec<TrafficRule>,
    count: usize,
    total: u32,
}

#[derive(Debug, Deserialize)]
struct EventsListResponse {
    events: Vec<TrafficEvent>,
    count: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

struct Client {
    base_url: String,
    operator: Option<String>,
    http: reqwest::Client,
}

impl Client {
    fn new(base_url: String, operator: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            operator,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url);
        if let Some(ref operator) = self.operator {
            req = req.header("x-operator-id", operator);
        }
        req
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, String> {
        let resp = req
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        let resp = check_status(resp).await?;
        resp.json().await.map_err(|e| format!("parse error: {}", e))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, String> {
        self.send(self.request(reqwest::Method::GET, path)).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> Result<T, String> {
        self.send(self.request(reqwest::Method::POST, path).json(body))
            .await
    }

    async fn put<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> Result<T, String> {
        self.send(self.request(reqwest::Method::PUT, path).json(body))
            .await
    }

    async fn delete(&self, path: &str) -> Result<(), String> {
        let resp = self
            .request(reqwest::Method::DELETE, path)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        check_status(resp).await.map(|_| ())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, String> {
    if resp.status().is_success() {
        return Ok(resp);
    }

    let status = resp.status();
    let err: ErrorResponse = resp.json().await.unwrap_or(ErrorResponse {
        error: "unknown error".to_string(),
    });
    Err(format!("{}: {}", status, err.error))
}

/// Read a YAML or JSON document. YAML is a superset of JSON, so one parser covers both.
fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    serde_yaml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
}

fn print_json(value: &impl Serialize) -> Result<(), String> {
    let out = serde_json::to_string_pretty(value).map_err(|e| format!("encode error: {}", e))?;
    println!("{}", out);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client = Client::new(cli.api, cli.operator);

    let result = match cli.command {
        Commands::Status => cmd_status(&client, cli.format).await,
        Commands::Rules(cmd) => cmd_rules(&client, cmd, cli.format).await,
        Commands::Events(cmd) => cmd_events(&client, cmd, cli.format).await,
        Commands::Test { rule, event } => cmd_test(&client, &rule, &event, cli.format).await,
        Commands::Process {
            ip,
            user_agent,
            affiliate,
            country,
            data,
        } => {
            let data = match data {
                Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("invalid --data: {}", e)),
                None => Ok(serde_json::Value::Null),
            };
            match data {
                Ok(data) => {
                    let input = TrafficEventInput {
                        data,
                        ip_address: ip,
                        user_agent,
                        affiliate_id: affiliate,
                        country,
                        ..Default::default()
                    };
                    cmd_process(&client, &input, cli.format).await
                }
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_status(client: &Client, format: OutputFormat) -> Result<(), String> {
    let health: HealthResponse = client.get("/v1/health").await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            let indicator = if health.status == "ok" { "●" } else { "○" };
            println!("{} Status: {}", indicator, health.status);
            println!("Version:      {}", health.version);
            println!("Uptime:       {}s", health.uptime_seconds);
            println!("Storage:      {}", health.storage);
            println!("Fail policy:  {}", health.fail_policy);
            match health.active_rules {
                Some(n) => println!("Active rules: {}", n),
                None => println!("Active rules: (store unavailable)"),
            }
        }
    }

    Ok(())
}

fn print_rule_table(rules: &[TrafficRule]) {
    println!(
        "{:<36}  {:<8}  {:<8}  {:<16}  {:<10}  {}",
        "ID", "PRIORITY", "STATUS", "TYPE", "ACTION", "NAME"
    );
    println!("{}", "-".repeat(100));

    for r in rules {
        let action = r
            .resolved_action()
            .map(|a| a.action_type.as_str())
            .unwrap_or("-");
        println!(
            "{:<36}  {:<8}  {:<8}  {:<16}  {:<10}  {}",
            r.id, r.priority, r.status, r.rule_type, action, r.name
        );
    }
}

fn print_rule(r: &TrafficRule) {
    println!("Rule ID:      {}", r.id);
    println!("Name:         {}", r.name);
    if let Some(desc) = &r.description {
        println!("Description:  {}", desc);
    }
    println!("Type:         {}", r.rule_type);
    println!("Priority:     {}", r.priority);
    println!("Status:       {}", r.status);
    println!("Updated:      {}", r.updated_at.to_rfc3339());
    println!("Conditions:");
    if r.conditions.is_empty() {
        println!("  (none, matches every request)");
    }
    for c in &r.conditions {
        let inactive = if c.is_active { "" } else { " [inactive]" };
        println!("  {} {} {}{}", c.field, c.operator.as_str(), c.value, inactive);
    }
    if let Some(action) = r.resolved_action() {
        println!("Action:       {}", action.action_type);
        for (key, value) in &action.parameters {
            println!("  {} = {}", key, value);
        }
    }
}

async fn cmd_rules(client: &Client, cmd: RuleCommands, format: OutputFormat) -> Result<(), String> {
    let rule = match cmd {
        RuleCommands::List { status, limit } => {
            let mut path = format!("/v1/rules?limit={}", limit);
            if let Some(s) = status {
                path.push_str(&format!("&status={}", s));
            }

            let resp: RulesListResponse = client.get(&path).await?;
            match format {
                OutputFormat::Json => print_json(&resp.rules)?,
                OutputFormat::Table => {
                    if resp.rules.is_empty() {
                        println!("No rules found.");
                        return Ok(());
                    }
                    print_rule_table(&resp.rules);
                    println!();
                    println!("Showing {} of {}", resp.count, resp.total);
                }
            }
            return Ok(());
        }

        RuleCommands::Get { id } => client.get::<TrafficRule>(&format!("/v1/rules/{}", id)).await?,

        RuleCommands::Create { file } => {
            let input: RuleInput = read_document(&file)?;
            let rule: TrafficRule = client.post("/v1/rules", &input).await?;
            eprintln!("Created rule {}", rule.id);
            rule
        }

        RuleCommands::Update { id, file } => {
            let input: RuleInput = read_document(&file)?;
            let rule: TrafficRule = client.put(&format!("/v1/rules/{}", id), &input).await?;
            eprintln!("Updated rule {}", rule.id);
            rule
        }

        RuleCommands::Enable { id } => {
            let body = serde_json::json!({ "status": "ACTIVE" });
            client.post(&format!("/v1/rules/{}/status", id), &body).await?
        }

        RuleCommands::Disable { id } => {
            let body = serde_json::json!({ "status": "INACTIVE" });
            client.post(&format!("/v1/rules/{}/status", id), &body).await?
        }

        RuleCommands::Delete { id } => {
            client.delete(&format!("/v1/rules/{}", id)).await?;
            println!("Deleted rule {}", id);
            return Ok(());
        }
    };

    match format {
        OutputFormat::Json => print_json(&rule)?,
        OutputFormat::Table => print_rule(&rule),
    }
    Ok(())
}

fn print_event(e: &TrafficEvent) {
    println!("Event ID:     {}", e.id);
    println!("Timestamp:    {}", e.timestamp.to_rfc3339());
    println!("Action:       {}", e.action);
    println!("Message:      {}", e.message);
    println!("Rule:         {}", e.rule_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()));
    println!("IP:           {}", e.ip_address);
    println!("Country:      {}", e.country.as_deref().unwrap_or("-"));
    println!("Device:       {} / {} / {}", e.device, e.browser, e.os);
    if let Some(affiliate) = &e.affiliate_id {
        println!("Affiliate:    {}", affiliate);
    }
}

async fn cmd_events(client: &Client, cmd: EventCommands, format: OutputFormat) -> Result<(), String> {
    match cmd {
        EventCommands::List {
            action,
            ip,
            rule,
            limit,
        } => {
            let mut path = format!("/v1/traffic/events?limit={}", limit);
            if let Some(a) = action {
                path.push_str(&format!("&action={}", a));
            }
            if let Some(ip) = ip {
                path.push_str(&format!("&ip={}", ip));
            }
            if let Some(r) = rule {
                path.push_str(&format!("&rule_id={}", r));
            }

            let resp: EventsListResponse = client.get(&path).await?;
            match format {
                OutputFormat::Json => print_json(&resp.events)?,
                OutputFormat::Table => {
                    if resp.events.is_empty() {
                        println!("No events found.");
                        return Ok(());
                    }

                    println!(
                        "{:<19}  {:<16}  {:<39}  {:<7}  {}",
                        "TIME", "ACTION", "IP", "COUNTRY", "MESSAGE"
                    );
                    println!("{}", "-".repeat(110));
                    for e in &resp.events {
                        let ts = e.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string();
                        println!(
                            "{:<19}  {:<16}  {:<39}  {:<7}  {}",
                            ts,
                            e.action,
                            e.ip_address,
                            e.country.as_deref().unwrap_or("-"),
                            e.message
                        );
                    }
                    println!();
                    println!("Count: {}", resp.count);
                }
            }
        }

        EventCommands::Get { id } => {
            let event: TrafficEvent = client.get(&format!("/v1/traffic/events/{}", id)).await?;
            match format {
                OutputFormat::Json => print_json(&event)?,
                OutputFormat::Table => print_event(&event),
            }
        }
    }

    Ok(())
}

async fn cmd_test(client: &Client, rule: &Path, event: &Path, format: OutputFormat) -> Result<(), String> {
    let body = serde_json::json!({
        "rule": read_document::<RuleInput>(rule)?,
        "event": read_document::<TrafficEventInput>(event)?,
    });
    let result: RuleTestResult = client.post("/v1/traffic/test-rule", &body).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            let verdict = if result.trace.matched { "MATCH" } else { "no match" };
            println!("Rule {}: {}", result.trace.rule_name, verdict);
            for c in &result.trace.condition_trace {
                let mark = if c.met { "✓" } else { "✗" };
                println!(
                    "  {} {} {} {} (actual: {})",
                    mark,
                    c.field,
                    c.operator.as_str(),
                    c.expected_value,
                    c.actual_value
                );
            }
            println!("Outcome: {} ({})", result.outcome.action, result.outcome.message);
        }
    }

    Ok(())
}

async fn cmd_process(client: &Client, input: &TrafficEventInput, format: OutputFormat) -> Result<(), String> {
    let result: ProcessedTraffic = client.post("/v1/traffic/process", input).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            println!("Outcome:  {}", result.outcome.action);
            println!("Message:  {}", result.outcome.message);
            if let Some(extra) = &result.outcome.extra {
                for (key, value) in extra {
                    println!("  {} = {}", key, value);
                }
            }
            println!("Event:    {}", result.event.id);
            println!("Evaluated {} rule(s)", result.decision.rule_trace.len());
        }
    }

    Ok(())
}
