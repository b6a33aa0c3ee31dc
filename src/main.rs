use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use ractor::{Actor, ActorRef, call};
use rustyline_async::{Readline, ReadlineEvent};

pub(crate) mod media;
pub(crate) mod room;
pub(crate) mod server;
pub(crate) mod signal;
pub(crate) mod store;
pub(crate) mod transport;

use media::Microphone;
use room::{Identity, RoomActor, RoomArgs, RoomMsg};
use store::{AccountStore, StoreError};
use transport::ws::WsTransport;

#[derive(Debug, Parser)]
#[command(name = "parlor", about = "Voice rooms for tabs on the same machine")]
enum Args {
    /// Serve the demo assets and the signaling relay.
    Serve {
        #[clap(long, short, env = "PARLOR_LISTEN", default_value = "0.0.0.0:3000")]
        listen: SocketAddr,
        #[clap(long, env = "PARLOR_PUBLIC_DIR", default_value = "public")]
        public_dir: PathBuf,
    },
    /// Run one participant ("tab") against a relay.
    Client {
        #[clap(long, short, env = "PARLOR_SERVER", default_value = "ws://127.0.0.1:3000")]
        server: String,
        #[clap(long, env = "PARLOR_DATA_DIR", default_value = ".parlor")]
        data_dir: PathBuf,
        /// STUN/TURN servers for connectivity probing.
        #[clap(
            long = "ice-server",
            value_delimiter = ',',
            default_value = "stun:stun.l.google.com:19302"
        )]
        ice_servers: Vec<String>,
        #[clap(long, value_enum, default_value = "silence")]
        microphone: Microphone,
    },
}

#[derive(Debug, Parser)]
enum Ui {
    /// Create an account and sign in.
    #[clap(alias = "su")]
    Signup {
        username: String,
        email: String,
        password: String,
    },
    #[clap(alias = "si")]
    Signin { username: String, password: String },
    #[clap(alias = "so")]
    Signout,
    /// Join a room, leaving the current one if any.
    #[clap(alias = "j")]
    Join { room: String },
    #[clap(alias = "l")]
    Leave,
    /// Toggle the microphone.
    #[clap(alias = "m")]
    Mute,
    /// List everyone known to be in the room.
    #[clap(alias = "p")]
    Peers,
    #[clap(alias = "s")]
    Status,
    #[clap(alias = "q")]
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    match Args::parse() {
        Args::Serve { listen, public_dir } => server::run(listen, public_dir).await,
        Args::Client {
            server,
            data_dir,
            ice_servers,
            microphone,
        } => client(server, data_dir, ice_servers, microphone).await,
    }
}

async fn client(
    server: String,
    data_dir: PathBuf,
    ice_servers: Vec<String>,
    microphone: Microphone,
) -> Result<()> {
    let store = AccountStore::new(data_dir);
    let (room, handle) = Actor::spawn(
        Some("room".to_string()),
        RoomActor,
        RoomArgs {
            transport: Arc::new(WsTransport::new(&server)),
            microphone,
            ice_servers,
        },
    )
    .await?;

    let (mut rl, mut stdout) = Readline::new("> ".to_string())?;

    // pick up a persisted session, dropping it if the account is gone
    if let Some(username) = store.session().await? {
        match store.find(&username).await? {
            Some(account) => {
                let identity = Identity {
                    username: account.username.clone(),
                    email: account.email,
                };
                call!(room, RoomMsg::SetUser, Some(identity))?;
                writeln!(stdout, "Signed in as {}.", account.username)?;
            }
            None => store.clear_session().await?,
        }
    }

    loop {
        let line = match rl.readline().await? {
            ReadlineEvent::Eof | ReadlineEvent::Interrupted => break,
            ReadlineEvent::Line(line) => line,
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line.clone());
        let parsed = shellwords::split(&line).map(|mut words| {
            words.insert(0, "".to_string());
            Ui::try_parse_from(words)
        });
        let cmd = match parsed {
            Err(err) => {
                writeln!(stdout, "Error parsing command: {err}")?;
                continue;
            }
            Ok(Err(err)) => {
                writeln!(stdout, "{err}")?;
                continue;
            }
            Ok(Ok(cmd)) => cmd,
        };
        match cmd {
            Ui::Signup {
                username,
                email,
                password,
            } => {
                let message = signup(&store, &room, username, email, password).await?;
                writeln!(stdout, "{message}")?;
            }
            Ui::Signin { username, password } => {
                let message = signin(&store, &room, username, password).await?;
                writeln!(stdout, "{message}")?;
            }
            Ui::Signout => {
                store.clear_session().await?;
                call!(room, RoomMsg::SetUser, None)?;
                writeln!(stdout, "Signed out.")?;
            }
            Ui::Join { room: name } => {
                let status = call!(room, RoomMsg::Join, name)?;
                writeln!(stdout, "{status}")?;
            }
            Ui::Leave => {
                let status = call!(room, RoomMsg::Leave)?;
                writeln!(stdout, "{status}")?;
            }
            Ui::Mute => {
                let status = call!(room, RoomMsg::Mute)?;
                writeln!(stdout, "{status}")?;
            }
            Ui::Peers => {
                let snapshot = call!(room, RoomMsg::Snapshot)?;
                match snapshot.username {
                    None => writeln!(stdout, "Not signed in.")?,
                    Some(me) => {
                        writeln!(stdout, "  - {me} (you)")?;
                        for (_, username) in snapshot.peers {
                            writeln!(stdout, "  - {username}")?;
                        }
                    }
                }
            }
            Ui::Status => {
                let snapshot = call!(room, RoomMsg::Snapshot)?;
                match &snapshot.username {
                    Some(username) => {
                        writeln!(stdout, "Signed in as {username} (tab {}).", snapshot.tab_id)?
                    }
                    None => writeln!(stdout, "Not signed in.")?,
                }
                match &snapshot.room_id {
                    Some(room_id) => writeln!(
                        stdout,
                        "Connected to room: {room_id} ({} peers, {} connections)",
                        snapshot.peers.len(),
                        snapshot.connections
                    )?,
                    None => writeln!(stdout, "Not connected to a room")?,
                }
                if snapshot.muted {
                    writeln!(stdout, "Microphone is muted.")?;
                }
            }
            Ui::Quit => break,
        }
    }

    // the tab is closing: leave cleanly before the process exits
    let _ = call!(room, RoomMsg::Leave);
    room.stop(None);
    let _ = handle.await;
    Ok(())
}

async fn signup(
    store: &AccountStore,
    room: &ActorRef<RoomMsg>,
    username: String,
    email: String,
    password: String,
) -> Result<String> {
    let username = username.trim().to_string();
    let email = email.trim().to_lowercase();
    if username.is_empty() || email.is_empty() || password.is_empty() {
        return Ok("Username, email and password are required.".to_string());
    }
    match store
        .create(&username, &email, &store::password_hash(&password))
        .await
    {
        Ok(account) => {
            store.set_session(&account.username).await?;
            let identity = Identity {
                username: account.username,
                email: account.email,
            };
            call!(room, RoomMsg::SetUser, Some(identity))?;
            Ok("Account created. You are signed in.".to_string())
        }
        Err(StoreError::UsernameTaken) => Ok("Username is already taken.".to_string()),
        Err(StoreError::EmailTaken) => Ok("Email is already in use.".to_string()),
        Err(err) => Err(err.into()),
    }
}

async fn signin(
    store: &AccountStore,
    room: &ActorRef<RoomMsg>,
    username: String,
    password: String,
) -> Result<String> {
    let username = username.trim().to_string();
    // one message for unknown users and wrong passwords alike
    if !store
        .verify(&username, &store::password_hash(&password))
        .await?
    {
        return Ok("Invalid username or password.".to_string());
    }
    let Some(account) = store.find(&username).await? else {
        return Ok("Invalid username or password.".to_string());
    };
    store.set_session(&account.username).await?;
    let identity = Identity {
        username: account.username,
        email: account.email,
    };
    call!(room, RoomMsg::SetUser, Some(identity))?;
    Ok("Signed in successfully.".to_string())
}
