//! Interactive Ivy bus probe.
//!
//! Subscribes to the regexps given on the command line, prints every
//! matching message and every lifecycle event, and sends each stdin line
//! onto the bus.  Lines starting with a dot are commands:
//!
//! ```text
//! .quit                   leave the bus and exit
//! .who                    list the connected agents
//! .bind REGEXP            add a subscription
//! .unbind ID              remove a subscription
//! .die AGENT              ask an agent to terminate
//! .direct AGENT ID MSG    send a direct message
//! .ping AGENT             measure the round-trip to an agent
//! ```

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use ivy_bus::{ApplicationEvent, IvyBus, RegexpEvent};

pub struct ProbeConfig {
    pub agent_name: String,
    pub bus: Option<String>,
    pub regexps: Vec<String>,
}

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

/// A parsed stdin line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text: broadcast it.
    Send(String),
    Quit,
    Who,
    Bind(String),
    Unbind(u32),
    Die(String),
    Direct {
        agent: String,
        num_id: i64,
        msg: String,
    },
    Ping(String),
}

/// Parse one stdin line.  Anything that does not start with `.` is a
/// message to broadcast.
pub fn parse_command(line: &str) -> Result<Command, String> {
    if !line.starts_with('.') {
        return Ok(Command::Send(line.to_owned()));
    }
    let rest = &line[1..];
    let (verb, args) = match rest.split_once(' ') {
        Some((verb, args)) => (verb, args.trim()),
        None => (rest, ""),
    };
    match verb {
        "quit" => Ok(Command::Quit),
        "who" => Ok(Command::Who),
        "bind" if !args.is_empty() => Ok(Command::Bind(args.to_owned())),
        "bind" => Err("usage: .bind REGEXP".to_owned()),
        "unbind" => args
            .parse()
            .map(Command::Unbind)
            .map_err(|_| "usage: .unbind ID".to_owned()),
        "die" if !args.is_empty() => Ok(Command::Die(args.to_owned())),
        "die" => Err("usage: .die AGENT".to_owned()),
        "ping" if !args.is_empty() => Ok(Command::Ping(args.to_owned())),
        "ping" => Err("usage: .ping AGENT".to_owned()),
        "direct" => {
            let mut parts = args.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(agent), Some(id), Some(msg)) if !agent.is_empty() => {
                    let num_id: i64 = id
                        .parse()
                        .map_err(|_| "usage: .direct AGENT ID MSG".to_owned())?;
                    Ok(Command::Direct {
                        agent: agent.to_owned(),
                        num_id,
                        msg: msg.to_owned(),
                    })
                }
                _ => Err("usage: .direct AGENT ID MSG".to_owned()),
            }
        }
        other => Err(format!("unknown command: .{}", other)),
    }
}

// ---------------------------------------------------------------------------
// Event printing
// ---------------------------------------------------------------------------

fn install_callbacks(bus: &IvyBus) {
    bus.bind_app_event(|peer, event| match event {
        ApplicationEvent::Connected => {
            println!("+ {} joined the bus", peer);
        }
        ApplicationEvent::Disconnected => {
            println!("- {} left the bus", peer);
        }
    });
    bus.bind_direct_msg(|peer, num_id, msg| {
        println!("direct from {} (id {}): {}", peer, num_id, msg);
    });
    bus.bind_regexp_change(|peer, event, num_id, regexp| {
        let what = match event {
            RegexpEvent::Added => "subscribes to",
            RegexpEvent::Removed => "unsubscribes from",
        };
        println!("{} {} {:?} (id {})", peer, what, regexp, num_id);
    });
    bus.bind_pong(|peer, delta| {
        println!("pong from {}: {:?}", peer, delta);
    });
}

fn subscribe(bus: &IvyBus, regexp: &str) {
    let shown = regexp.to_owned();
    let id = bus.bind_msg(regexp, move |peer, captures| {
        println!("{} matched {:?}: {:?}", peer, shown, captures);
    });
    println!("subscribed ({}) {:?}", id, regexp);
}

fn execute(bus: &IvyBus, command: Command) -> bool {
    match command {
        Command::Quit => return false,
        Command::Send(text) => {
            let count = bus.send_msg(&text);
            println!("-> {} match(es)", count);
        }
        Command::Who => {
            for name in bus.get_application_list() {
                println!("{}", name);
            }
        }
        Command::Bind(regexp) => subscribe(bus, &regexp),
        Command::Unbind(id) => match bus.unbind_msg(id) {
            Ok(regexp) => println!("unsubscribed ({}) {:?}", id, regexp),
            Err(e) => println!("{}", e),
        },
        Command::Die(agent) => match bus.get_application(&agent) {
            Some(peer) => bus.send_die_msg(&peer),
            None => println!("no agent named {:?}", agent),
        },
        Command::Direct { agent, num_id, msg } => {
            if !bus.send_direct_msg_to(&agent, num_id, &msg, true) {
                println!("no agent named {:?}", agent);
            }
        }
        Command::Ping(agent) => match bus.get_application(&agent) {
            Some(peer) => bus.send_ping(&peer),
            None => println!("no agent named {:?}", agent),
        },
    }
    true
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

/// Run the probe until stdin closes, `.quit`, or a DIE from the bus.
pub async fn run(config: ProbeConfig) -> Result<(), ivy_bus::IvyError> {
    let bus = IvyBus::new(config.agent_name.as_str(), None);
    install_callbacks(&bus);
    for regexp in &config.regexps {
        subscribe(&bus, regexp);
    }

    bus.start(config.bus.as_deref()).await?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        tokio::select! {
            _ = bus.wait() => {
                // Stopped from the bus side (an accepted DIE).
                return Ok(());
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.is_empty() => {}
                    Ok(Some(line)) => {
                        match parse_command(&line) {
                            Ok(command) => {
                                if !execute(&bus, command) {
                                    break;
                                }
                            }
                            Err(usage) => println!("{}", usage),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "stdin error");
                        break;
                    }
                }
            }
        }
    }

    match bus.stop().await {
        // A DIE accepted while we were reading stdin already stopped us.
        Err(ivy_bus::IvyError::NotRunning) => Ok(()),
        result => result,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
