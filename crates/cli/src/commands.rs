use parley_chat::{SessionId, SettingsPatch, Temperature};
use parley_llm::ChatProvider;
use snafu::{OptionExt, Snafu, ensure};

pub const HELP: &str = "\
commands:
  <text>                       send a message
  /new                         start a new chat
  /switch <id>                 switch to a chat
  /delete [id]                 delete a chat (default: the active one)
  /delete-all                  delete every chat (asks for confirmation)
  /clear                       clear the active chat
  /stop                        stop the running generation
  /retry                       re-send the last message
  /rename <title>              rename the active chat
  /list                        list chats
  /set provider <name>         OpenAI, Gemini or Dialogflow
  /set model <id>
  /set temperature <preset>    precise, balanced, creative or 0.5/0.7/1.0
  /set system <prompt>
  /save-defaults               use the active chat's settings for new chats
  /help
  /quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    New,
    Switch(SessionId),
    Delete(Option<SessionId>),
    DeleteAll,
    Clear,
    Stop,
    Retry,
    Rename(String),
    List,
    Set(SettingsPatch),
    SaveDefaults,
    Help,
    Quit,
}

#[derive(Debug, Snafu)]
pub enum CommandError {
    #[snafu(display("unknown command '/{name}', try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("usage: {usage}"))]
    MissingArgument {
        stage: &'static str,
        usage: &'static str,
    },
    #[snafu(display("invalid {field} '{value}'"))]
    InvalidValue {
        stage: &'static str,
        field: &'static str,
        value: String,
    },
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let Some(body) = trimmed.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.trim_end().to_string())));
    };

    let (name, rest) = split_word(body);
    let command = match name {
        "new" => Command::New,
        "switch" => Command::Switch(SessionId::new(required(rest, "/switch <id>")?)),
        "delete" => Command::Delete((!rest.is_empty()).then(|| SessionId::new(rest))),
        "delete-all" => Command::DeleteAll,
        "clear" => Command::Clear,
        "stop" => Command::Stop,
        "retry" => Command::Retry,
        "rename" => Command::Rename(required(rest, "/rename <title>")?.to_string()),
        "list" => Command::List,
        "set" => Command::Set(parse_setting(rest)?),
        "save-defaults" => Command::SaveDefaults,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => {
            return UnknownCommandSnafu {
                stage: "parse-command",
                name,
            }
            .fail();
        }
    };
    Ok(Some(command))
}

fn parse_setting(rest: &str) -> Result<SettingsPatch, CommandError> {
    const USAGE: &str = "/set provider|model|temperature|system <value>";
    let (field, value) = split_word(rest);
    let value = required(value, USAGE)?;

    let patch = SettingsPatch::default();
    match field {
        "provider" => {
            let provider = ChatProvider::parse(value).context(InvalidValueSnafu {
                stage: "parse-provider",
                field: "provider",
                value,
            })?;
            Ok(patch.provider(provider))
        }
        "model" => Ok(patch.model(value)),
        "temperature" => {
            let temperature = Temperature::parse(value).context(InvalidValueSnafu {
                stage: "parse-temperature",
                field: "temperature",
                value,
            })?;
            Ok(patch.temperature(temperature))
        }
        "system" => Ok(patch.system_prompt(value)),
        _ => MissingArgumentSnafu {
            stage: "parse-setting",
            usage: USAGE,
        }
        .fail(),
    }
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim();
    match input.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (input, ""),
    }
}

fn required<'a>(value: &'a str, usage: &'static str) -> Result<&'a str, CommandError> {
    ensure!(
        !value.is_empty(),
        MissingArgumentSnafu {
            stage: "parse-argument",
            usage,
        }
    );
    Ok(value)
}

/// Reads a yes/no answer; anything but an explicit yes declines.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
