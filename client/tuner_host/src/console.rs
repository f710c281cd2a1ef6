use std::io::{self, BufRead};
use std::ops::ControlFlow;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use tracing::{info, warn};
use tuner_runtime::{
    Connection, NodeSnapshot, Param, ParamCell, ParamId, ParamKind, ParamValue, Presenter,
    ProtocolError, Scalar,
};

pub const USAGE: &str = "commands: nodes | node <endpoint> | params | set <id> <json value> | scopes | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Nodes,
    Node(String),
    Params,
    Set { id: ParamId, value: ParamValue },
    Scopes,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map(|(word, rest)| (word, rest.trim()))
        .unwrap_or((line, ""));

    match (word, rest) {
        ("nodes", "") => Ok(Command::Nodes),
        ("node", endpoint) if !endpoint.is_empty() => Ok(Command::Node(endpoint.to_string())),
        ("params", "") => Ok(Command::Params),
        ("scopes", "") => Ok(Command::Scopes),
        ("quit" | "exit", "") => Ok(Command::Quit),
        ("set", args) => {
            let (id, raw) = args
                .split_once(char::is_whitespace)
                .ok_or_else(|| "set needs an id and a value".to_string())?;
            let id = id
                .parse::<ParamId>()
                .map_err(|err| format!("bad parameter id '{id}': {err}"))?;
            let value = serde_json::from_str::<ParamValue>(raw.trim())
                .map_err(|err| format!("bad value '{}': {err}", raw.trim()))?;
            Ok(Command::Set { id, value })
        }
        _ => Err(USAGE.to_string()),
    }
}

/// Reads operator commands from stdin on a helper thread. The session ends
/// when stdin closes or `quit` is entered.
pub struct ConsolePresenter {
    lines: Receiver<String>,
}

impl ConsolePresenter {
    pub fn from_stdin() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self::new(rx)
    }

    pub fn new(lines: Receiver<String>) -> Self {
        Self { lines }
    }

    fn execute(&self, connection: &Connection, command: Command) -> ControlFlow<()> {
        match command {
            Command::Nodes => {
                for endpoint in connection.available_endpoints().get() {
                    println!("{endpoint}");
                }
            }
            Command::Node(endpoint) => connection.set_current_node(&endpoint),
            Command::Params => with_node(connection, |node| {
                for cell in &node.params {
                    print_tree(cell, 0);
                }
            }),
            Command::Scopes => with_node(connection, |node| {
                for (index, scope) in node.scopes.iter().enumerate() {
                    let data = scope.data.get();
                    let span = data
                        .first()
                        .and_then(|times| Some((*times.first()?, *times.last()?)));
                    println!(
                        "[{index}] {} ({}) {} samples, window {}s, span {:?}",
                        scope.name,
                        scope.labels.join(", "),
                        scope.len(),
                        scope.keep_last_secs,
                        span
                    );
                }
            }),
            Command::Set { id, value } => with_node(connection, |node| {
                let Some(cell) = node.param(id) else {
                    println!("no parameter with id {id}");
                    return;
                };
                match cell.get().with_value(value) {
                    Ok(edited) => cell.set(edited),
                    Err(err) => println!("{err}"),
                }
            }),
            Command::Quit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}

impl Presenter for ConsolePresenter {
    fn attach(&mut self, connection: &Connection) {
        connection
            .state()
            .subscribe(|state| info!(?state, "connection state changed"));
        connection
            .available_endpoints()
            .subscribe(|endpoints| info!(?endpoints, "available endpoints"));
        connection
            .disconnected()
            .subscribe(|address| {
                if let Some(address) = address {
                    warn!(%address, "node went away");
                }
            });
        connection.current_node().subscribe(|node| match node {
            Some(node) => {
                info!(
                    address = %node.address,
                    params = node.id2param.len(),
                    scopes = node.scopes.len(),
                    "node ready"
                );
                watch_params(node);
            }
            None => info!("no node selected"),
        });
        println!("{USAGE}");
    }

    fn tick(&mut self, connection: &Connection) -> ControlFlow<()> {
        loop {
            let line = match self.lines.try_recv() {
                Ok(line) => line,
                Err(TryRecvError::Empty) => return ControlFlow::Continue(()),
                Err(TryRecvError::Disconnected) => return ControlFlow::Break(()),
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(command) => {
                    if self.execute(connection, command).is_break() {
                        return ControlFlow::Break(());
                    }
                }
                Err(message) => println!("{message}"),
            }
        }
    }

    fn on_protocol_error(&mut self, err: &ProtocolError) {
        println!("server sent something unexpected: {err}");
    }
}

fn with_node(connection: &Connection, action: impl FnOnce(&NodeSnapshot)) {
    match connection.current_node().get() {
        Some(node) => action(&node),
        None => println!("no node selected"),
    }
}

fn watch_params(node: &NodeSnapshot) {
    for cell in node.id2param.values() {
        cell.subscribe(|param| {
            if let Some(value) = param.value() {
                info!(id = param.id, name = %param.name, ?value, "parameter updated");
            }
        });
    }
}

fn print_tree(cell: &ParamCell, depth: usize) {
    let param = cell.get();
    let indent = "  ".repeat(depth);
    println!("{indent}{}", describe(&param));
    for (_, child) in param.visible_children() {
        print_tree(child, depth + 1);
    }
}

fn describe(param: &Param) -> String {
    let head = format!("#{} {} [{}]", param.id, param.name, param.kind.label());
    match &param.kind {
        ParamKind::Scalar(Scalar::Bool(flag)) => format!("{head} = {flag}"),
        ParamKind::Scalar(Scalar::Text(text)) => format!("{head} = {text:?}"),
        ParamKind::Numeric { val, min, max, .. } => {
            format!("{head} = {val} (min {min:?}, max {max:?})")
        }
        ParamKind::Vector { val, .. } => format!("{head} = {val:?}"),
        ParamKind::Enum { val, oneof } => format!("{head} = {val:?} of {oneof:?}"),
        ParamKind::Hyper { .. } => head,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("nodes"), Ok(Command::Nodes));
        assert_eq!(parse_command("  params "), Ok(Command::Params));
        assert_eq!(parse_command("scopes"), Ok(Command::Scopes));
        assert_eq!(parse_command("quit"), Ok(Command::Quit));
        assert_eq!(
            parse_command("node 10.0.0.2:4000"),
            Ok(Command::Node("10.0.0.2:4000".into()))
        );
    }

    #[test]
    fn set_parses_json_values() {
        assert_eq!(
            parse_command("set 3 2.5"),
            Ok(Command::Set {
                id: 3,
                value: ParamValue::Number(2.5)
            })
        );
        assert_eq!(
            parse_command("set 4 [1, 2]"),
            Ok(Command::Set {
                id: 4,
                value: ParamValue::Vector(vec![1.0, 2.0])
            })
        );
        assert_eq!(
            parse_command("set 5 \"manual\""),
            Ok(Command::Set {
                id: 5,
                value: ParamValue::Text("manual".into())
            })
        );
        assert_eq!(
            parse_command("set 6 false"),
            Ok(Command::Set {
                id: 6,
                value: ParamValue::Bool(false)
            })
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse_command("dance"), Err(USAGE.to_string()));
        assert_eq!(parse_command("node"), Err(USAGE.to_string()));
        assert!(parse_command("set 3").is_err());
        assert!(parse_command("set x 1").is_err());
        assert!(parse_command("set 3 {oops").is_err());
    }

    #[test]
    fn closed_input_ends_the_session() {
        let (tx, rx) = mpsc::channel();
        tx.send("quit".to_string()).expect("send");
        let mut presenter = ConsolePresenter::new(rx);
        let (outbound, _out) = tuner_runtime::outbound::Outbound::channel(4);
        let connection = Connection::new(outbound, &tuner_runtime::RuntimeConfig::default());
        assert!(presenter.tick(&connection).is_break());

        drop(tx);
        assert!(presenter.tick(&connection).is_break());
    }
}
