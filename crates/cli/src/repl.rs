use std::io::Write;

use parley_chat::{
    ChatController, ChatUpdate, ConfigStore, DELETE_ALL_PROMPT, Message, SendOutcome, Sender,
    SessionId,
};
use snafu::{ResultExt, Whatever};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::commands::{self, Command, HELP};

pub struct Repl {
    controller: ChatController,
    config_store: ConfigStore,
    awaiting_delete_all: bool,
}

impl Repl {
    pub fn new(controller: ChatController, config_store: ConfigStore) -> Self {
        Self {
            controller,
            config_store,
            awaiting_delete_all: false,
        }
    }

    pub async fn run(mut self) -> Result<(), Whatever> {
        self.print_active_session();
        println!("type /help for commands");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let pending = self.controller.has_pending_work();
            tokio::select! {
                line = lines.next_line() => {
                    let line = line.whatever_context::<_, Whatever>("failed to read from stdin")?;
                    let Some(line) = line else {
                        break;
                    };
                    if !self.handle_line(&line) {
                        break;
                    }
                }
                Some(update) = self.controller.next_update(), if pending => {
                    self.render_update(update);
                }
            }
        }

        if self.controller.stop_generation() {
            tracing::info!("stopped running generation on exit");
        }
        Ok(())
    }

    /// Returns `false` when the session should end.
    fn handle_line(&mut self, line: &str) -> bool {
        if self.awaiting_delete_all {
            self.awaiting_delete_all = false;
            let confirmed = commands::is_affirmative(line);
            if !self.controller.delete_all_sessions(|_| confirmed) {
                println!("kept chat history");
            } else {
                println!("deleted all chats");
                self.print_active_session();
            }
            return true;
        }

        let command = match commands::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return true,
            Err(error) => {
                println!("{error}");
                return true;
            }
        };

        match command {
            Command::Send(text) => report_send(self.controller.send_message(&text, Vec::new())),
            Command::New => {
                let session_id = self.controller.start_new_chat();
                println!("started {session_id}");
            }
            Command::Switch(session_id) => {
                if self.controller.switch_chat(&session_id) {
                    self.print_active_session();
                    self.print_transcript();
                } else {
                    println!("no chat named {session_id}, see /list");
                }
            }
            Command::Delete(session_id) => {
                let Some(session_id) = session_id.or_else(|| self.controller.active_session_id().cloned())
                else {
                    return true;
                };
                if self.controller.delete_chat(&session_id) {
                    println!("deleted {session_id}");
                    self.print_active_session();
                } else {
                    println!("no chat named {session_id}, see /list");
                }
            }
            Command::DeleteAll => {
                println!("{DELETE_ALL_PROMPT} [y/N]");
                self.awaiting_delete_all = true;
            }
            Command::Clear => {
                self.controller.clear_chat();
                println!("cleared");
            }
            Command::Stop => {
                if self.controller.stop_generation() {
                    println!("\n[stopped]");
                } else {
                    println!("nothing is running");
                }
            }
            Command::Retry => match self.controller.retry_last_message() {
                SendOutcome::Ignored => println!("nothing to retry"),
                outcome => report_send(outcome),
            },
            Command::Rename(title) => {
                let renamed = self
                    .controller
                    .active_session_id()
                    .cloned()
                    .is_some_and(|session_id| self.controller.rename_chat(&session_id, &title));
                if renamed {
                    println!("renamed to {title}");
                }
            }
            Command::List => self.print_sessions(),
            Command::Set(patch) => {
                self.controller.update_settings(patch);
                self.print_settings();
            }
            Command::SaveDefaults => {
                let settings = self.controller.settings().clone();
                match self.config_store.update_default_settings(settings) {
                    Ok(()) => println!("saved defaults to {}", self.config_store.config_path().display()),
                    Err(error) => {
                        tracing::error!(error = %error, "failed to save default settings");
                        println!("could not save defaults: {error}");
                    }
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
        }
        true
    }

    fn render_update(&self, update: ChatUpdate) {
        let visible = |session_id: &SessionId| self.controller.active_session_id() == Some(session_id);
        match update {
            ChatUpdate::Fragment {
                session_id, text, ..
            } => {
                if visible(&session_id) {
                    print!("{text}");
                    flush_stdout();
                }
            }
            ChatUpdate::Completed { session_id, .. } => {
                if visible(&session_id) {
                    println!();
                }
            }
            ChatUpdate::Failed {
                session_id, error, ..
            } => {
                if visible(&session_id) {
                    println!("\n[error] {error}");
                }
            }
            ChatUpdate::Cancelled { session_id, .. } => {
                if visible(&session_id) {
                    println!("\n[stopped]");
                }
            }
            ChatUpdate::TitleDerived { session_id, title } => {
                if visible(&session_id) {
                    println!("[title] {title}");
                }
            }
            ChatUpdate::TitleFailed { .. } => {}
        }
    }

    fn print_active_session(&self) {
        if let Some(session) = self.controller.active_session() {
            println!(
                "chat {} \"{}\" ({} messages)",
                session.id,
                session.title,
                session.messages.len()
            );
        }
    }

    fn print_transcript(&self) {
        for message in self.controller.messages() {
            println!("{}", transcript_line(message));
        }
    }

    fn print_sessions(&self) {
        let active = self.controller.active_session_id();
        for session in self.controller.sessions() {
            let marker = if Some(&session.id) == active { "*" } else { " " };
            println!(
                "{marker} {}  {}  ({} messages)",
                session.id,
                session.title,
                session.messages.len()
            );
        }
    }

    fn print_settings(&self) {
        let settings = self.controller.settings();
        println!(
            "provider {} | model {} | temperature {} | system \"{}\"",
            settings.provider, settings.model, settings.temperature, settings.system_prompt
        );
    }
}

fn report_send(outcome: SendOutcome) {
    match outcome {
        SendOutcome::Ignored => {}
        SendOutcome::Streaming { .. } => {
            print!("bot> ");
            flush_stdout();
        }
        SendOutcome::Refused { error } => println!("[error] {error}"),
    }
}

fn transcript_line(message: &Message) -> String {
    let speaker = match message.sender {
        Sender::User => "you",
        Sender::Bot => "bot",
    };
    let attachments = message
        .attachments
        .iter()
        .map(|attachment| format!(" [{}]", attachment.name))
        .collect::<String>();
    format!("{speaker}> {}{attachments}", message.text)
}

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use parley_chat::{Attachment, MessageId};

    use super::*;

    #[test]
    fn transcript_lines_name_the_speaker_and_attachments() {
        let message = Message::user(
            MessageId::from("1"),
            "look",
            vec![Attachment::new("photo.png", "image/png", "data:,")],
        );

        assert_eq!(transcript_line(&message), "you> look [photo.png]");
    }
}
