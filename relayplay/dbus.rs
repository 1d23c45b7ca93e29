use crate::error::App;
use crate::player::CommandChannel;
use log::info;
use tokio::sync::mpsc::{self, error::TryRecvError};
use zbus::{fdo, interface, Connection, ConnectionBuilder};

pub const DEFAULT_BUS_NAME: &str = "org.relayplay.Player";
pub const OBJECT_PATH: &str = "/org/relayplay/Player";

#[derive(Clone)]
pub struct PlayerDBus {
    tx: mpsc::UnboundedSender<String>,
}

#[interface(name = "org.relayplay.Player")]
impl PlayerDBus {
    async fn test_connection(&self) -> fdo::Result<()> {
        Ok(())
    }

    /// Hands a raw command token to the control loop without waiting on it.
    async fn submit(&self, token: String) -> fdo::Result<()> {
        self.tx
            .send(token)
            .map_err(|_| fdo::Error::Failed("Player is shutting down".into()))
    }
}

/// Session-bus endpoint feeding tokens to the control loop.
pub struct DbusChannel {
    name: String,
    connection: Option<Connection>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl DbusChannel {
    pub async fn open(name: &str) -> Result<Self, App> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionBuilder::session()?
            .name(name)?
            .serve_at(OBJECT_PATH, PlayerDBus { tx })?
            .build()
            .await?;
        info!("Listening for commands on {} {}", name, OBJECT_PATH);
        Ok(Self {
            name: name.to_string(),
            connection: Some(connection),
            rx,
        })
    }
}

impl CommandChannel for DbusChannel {
    fn try_receive(&mut self) -> Result<Option<String>, App> {
        match self.rx.try_recv() {
            Ok(token) => Ok(Some(token)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(App::ChannelUnavailable(format!(
                "{} is no longer receiving",
                self.name
            ))),
        }
    }

    fn close(&mut self) {
        self.rx.close();
        if self.connection.take().is_some() {
            info!("Released bus name {}", self.name);
        }
    }
}
