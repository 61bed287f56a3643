use std::path::PathBuf;

use core_types::ProviderId;

pub const HELP: &str = "\
Commands:
  /provider <gemini|groq|local>  switch provider
  /key <provider> <key>          store an API key (blank removes it)
  /model <id>                    change the active provider's model
  /attach <path>                 attach a file to the next message
  /detach                        drop the pending attachment
  /voice                         voice mode: typed lines act as speech
  /text                          back to text mode
  /history                       print the conversation
  /quit                          exit
Anything else is sent as a message.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    Provider(ProviderId),
    Key { provider: ProviderId, key: String },
    Model(String),
    Attach(PathBuf),
    Detach,
    Voice,
    Text,
    History,
    Help,
    Quit,
}

pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    match name {
        "provider" => provider(args).map(Command::Provider),
        "key" => {
            let (id, key) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
            Ok(Command::Key {
                provider: provider(id)?,
                key: key.trim().to_string(),
            })
        }
        "model" if !args.is_empty() => Ok(Command::Model(args.to_string())),
        "model" => Err("usage: /model <id>".to_string()),
        "attach" if !args.is_empty() => Ok(Command::Attach(PathBuf::from(args))),
        "attach" => Err("usage: /attach <path>".to_string()),
        "detach" => Ok(Command::Detach),
        "voice" => Ok(Command::Voice),
        "text" => Ok(Command::Text),
        "history" => Ok(Command::History),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command `/{other}`, try /help")),
    }
}

fn provider(arg: &str) -> Result<ProviderId, String> {
    arg.parse()
        .map_err(|_| format!("unknown provider `{arg}`, expected gemini, groq or local"))
}
