//! Terminal front end for the socketchat client
//!
//! Inbound messages arrive on the client's receive task through a
//! `ConsolePrinter` listener; the chat loop reads stdin on the main task and
//! writes each line to the server.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use socketchat_client::{MessageListener, SocketClient};
use socketchat_core::{ConnectionState, Message};

use crate::config::{AppConfig, CliConfig};
use crate::error::Result;

// ----------------------------------------------------------------------------
// Output
// ----------------------------------------------------------------------------

/// How inbound messages are written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text { timestamps: bool },
    Json,
}

/// Listener printing inbound messages to stdout
#[derive(Debug, Clone, Copy)]
pub struct ConsolePrinter {
    format: OutputFormat,
}

impl ConsolePrinter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Line printed for a message, or `None` when it is not shown
    pub fn render(&self, message: &Message) -> Option<String> {
        match self.format {
            OutputFormat::Json => match serde_json::to_string(message) {
                Ok(line) => Some(line),
                Err(e) => {
                    warn!("Failed to serialize message: {}", e);
                    None
                }
            },
            OutputFormat::Text { timestamps } => match message {
                Message::ServerSend(m) if timestamps => Some(format!(
                    "[{}] {}: {}",
                    m.timestamp(),
                    m.sender_username(),
                    m.text()
                )),
                Message::ServerSend(m) => Some(format!("{}: {}", m.sender_username(), m.text())),
                Message::Error(m) => {
                    error!("Server error: {}", m.error_message());
                    None
                }
                Message::Recall(m) => {
                    debug!("Ignoring recall of {}", m.id());
                    None
                }
                Message::ClientSend(m) => {
                    warn!("Unexpected client message {} from server", m.id());
                    None
                }
            },
        }
    }
}

impl MessageListener for ConsolePrinter {
    fn on_message_received(&self, message: &Message) {
        if let Some(line) = self.render(message) {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        }
    }
}

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

/// CLI application wrapping the process-wide client
pub struct ChatApp {
    client: Arc<SocketClient>,
    cli: CliConfig,
}

impl ChatApp {
    /// Create the process-wide client from the loaded configuration
    pub fn new(config: AppConfig) -> Result<Self> {
        let client = socketchat_client::init_client(config.client)?;
        Ok(Self::with_client(client, config.cli))
    }

    pub fn with_client(client: Arc<SocketClient>, cli: CliConfig) -> Self {
        Self { client, cli }
    }

    pub fn client(&self) -> &Arc<SocketClient> {
        &self.client
    }

    /// Interactive chat on stdin until `/quit`, EOF or connection loss
    pub async fn run_chat(&self) -> Result<()> {
        self.client.set_message_listener(Arc::new(ConsolePrinter::new(OutputFormat::Text {
            timestamps: self.cli.show_timestamps,
        })));
        self.client.start_listening().await?;
        println!(
            "Connected to {} as {}. Type /quit to exit, /status for connection details.",
            self.client.config().server_addr,
            self.client.username()
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut states = self.client.state_changes();

        loop {
            self.prompt();
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if !self.handle_input(line.trim()).await? {
                        break;
                    }
                }
                changed = states.wait_for(|state| state.is_closed()) => {
                    if let Ok(state) = changed {
                        let state = state.clone();
                        println!("\n{}", Self::describe_closed(&state));
                    }
                    return Ok(());
                }
            }
        }

        self.client.disconnect();
        info!("Chat session ended");
        Ok(())
    }

    /// Returns false when the session should end
    async fn handle_input(&self, line: &str) -> Result<bool> {
        match line {
            "" => Ok(true),
            "/quit" => Ok(false),
            "/status" => {
                println!("{}", self.status_line());
                Ok(true)
            }
            text => {
                let message = self.client.compose(text);
                self.client.write_to_server(&message).await?;
                debug!("Sent {}", message.id());
                Ok(true)
            }
        }
    }

    /// Send one message and disconnect
    pub async fn send_once(&self, text: String) -> Result<()> {
        self.client.start_listening().await?;
        let message = self.client.compose(text);
        let result = self.client.write_to_server(&message).await;
        self.client.disconnect();
        result?;

        println!("Message sent (ID: {})", message.id());
        Ok(())
    }

    /// Print inbound messages until the connection closes or Ctrl+C
    pub async fn listen(&self, json: bool) -> Result<()> {
        let format = if json {
            OutputFormat::Json
        } else {
            OutputFormat::Text {
                timestamps: self.cli.show_timestamps,
            }
        };
        self.client
            .set_message_listener(Arc::new(ConsolePrinter::new(format)));
        self.client.start_listening().await?;
        info!("Listening on {}... Press Ctrl+C to stop", self.client.config().server_addr);

        let mut states = self.client.state_changes();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                self.client.disconnect();
            }
            changed = states.wait_for(|state| state.is_closed()) => {
                if let Ok(state) = changed {
                    let state = state.clone();
                    warn!("{}", Self::describe_closed(&state));
                }
            }
        }
        Ok(())
    }

    pub fn status_line(&self) -> String {
        let stats = self.client.stats();
        format!(
            "{} | received {} | sent {} | rejected {} | undelivered {}",
            self.client.state(),
            stats.messages_received,
            stats.messages_sent,
            stats.frames_rejected,
            stats.messages_undelivered
        )
    }

    fn prompt(&self) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{}", self.cli.prompt);
        let _ = stdout.flush();
    }

    fn describe_closed(state: &ConnectionState) -> String {
        match state.close_reason() {
            Some(reason) => format!("Connection lost: {}", reason),
            None => "Disconnected".to_string(),
        }
    }
}
