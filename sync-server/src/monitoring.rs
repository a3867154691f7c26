use chrono::Local;
use colored::*;
use sync_core::protocol::{Request, Response};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone)]
pub enum LogMessage {
    ClientConnected { connection_id: String },
    ClientDisconnected { connection_id: String },
    RequestReceived { connection_id: String, has_push: bool, has_pull: bool },
    ResponseSent { connection_id: String, accepted_commit_seq: Option<i64>, conflict_count: usize },
    Error { message: String },
}

#[derive(Clone)]
pub struct MonitoringLayer {
    tx: mpsc::Sender<LogMessage>,
}

impl MonitoringLayer {
    pub fn new(tx: mpsc::Sender<LogMessage>) -> Self {
        Self { tx }
    }

    pub async fn log_client_connected(&self, connection_id: &str) {
        let _ = self.tx.send(LogMessage::ClientConnected { connection_id: connection_id.to_string() }).await;
    }

    pub async fn log_client_disconnected(&self, connection_id: &str) {
        let _ = self.tx.send(LogMessage::ClientDisconnected { connection_id: connection_id.to_string() }).await;
    }

    pub async fn log_request_received(&self, connection_id: &str, request: &Request) {
        let _ = self
            .tx
            .send(LogMessage::RequestReceived {
                connection_id: connection_id.to_string(),
                has_push: request.push.is_some(),
                has_pull: request.pull.is_some(),
            })
            .await;
    }

    pub async fn log_response_sent(&self, connection_id: &str, response: &Response) {
        let _ = self
            .tx
            .send(LogMessage::ResponseSent {
                connection_id: connection_id.to_string(),
                accepted_commit_seq: response.push.as_ref().map(|p| p.accepted_commit_seq),
                conflict_count: response.push.as_ref().map(|p| p.conflicts.len()).unwrap_or(0),
            })
            .await;
    }

    pub async fn log_error(&self, message: String) {
        let _ = self.tx.send(LogMessage::Error { message }).await;
    }
}

pub async fn spawn_monitoring_display(mut rx: mpsc::Receiver<LogMessage>) {
    tokio::spawn(async move {
        info!("{}", "Activity Log:".bold());
        info!("{}", "-".repeat(80).dimmed());

        while let Some(log) = rx.recv().await {
            let timestamp = Local::now().format("%H:%M:%S%.3f");

            match log {
                LogMessage::ClientConnected { connection_id } => {
                    info!(
                        "{} {} connected: {}",
                        timestamp.to_string().dimmed(),
                        "->".green().bold(),
                        connection_id.yellow()
                    );
                }
                LogMessage::ClientDisconnected { connection_id } => {
                    info!(
                        "{} {} disconnected: {}",
                        timestamp.to_string().dimmed(),
                        "<-".red().bold(),
                        connection_id.yellow()
                    );
                }
                LogMessage::RequestReceived { connection_id, has_push, has_pull } => {
                    info!(
                        "{} {} request (push={}, pull={}) from {}",
                        timestamp.to_string().dimmed(),
                        "v".blue(),
                        has_push,
                        has_pull,
                        connection_id.yellow()
                    );
                }
                LogMessage::ResponseSent { connection_id, accepted_commit_seq, conflict_count } => {
                    info!(
                        "{} {} response (commit_seq={:?}, conflicts={}) to {}",
                        timestamp.to_string().dimmed(),
                        "^".green(),
                        accepted_commit_seq,
                        conflict_count,
                        connection_id.yellow()
                    );
                }
                LogMessage::Error { message } => {
                    info!("{} {} {}", timestamp.to_string().dimmed(), "x".red().bold(), message.red());
                }
            }
        }
    });
}
