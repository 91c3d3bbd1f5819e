/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    Call(String),
    HangUp(Option<String>),
    Quit,
    Say(String),
    Unknown(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Say(line.to_string());
        };
        let mut parts = rest.splitn(2, char::is_whitespace);
        let verb = parts.next().unwrap_or_default();
        let argument = parts.next().map(str::trim).filter(|arg| !arg.is_empty());
        match (verb, argument) {
            ("peers", _) => Command::Peers,
            ("call", Some(peer)) => Command::Call(peer.to_string()),
            ("hangup", peer) => Command::HangUp(peer.map(str::to_string)),
            ("quit" | "exit", _) => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

pub const HELP: &str = "commands: /peers, /call <peer>, /hangup [peer], /quit; anything else is sent as chat";
