use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use super::protocol::Message;
use crate::error::Result;

/// Pause between the two sends of [`run_client`]
const SEND_INTERVAL: Duration = Duration::from_secs(2);

/// Line-oriented client for the dispatch server
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect and read the greeting. Returns the client and the greeting line.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<(Self, String)> {
        let stream = TcpStream::connect(addr).await?;
        debug!(peer = ?stream.peer_addr().ok(), "Connected");
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let greeting = client.recv_line().await?.unwrap_or_default();
        Ok((client, greeting))
    }

    /// Send a raw line, appending the terminator if missing
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.send_line(&message.encode()?).await
    }

    /// Next line from the server, `None` once the connection is closed
    pub async fn recv_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Next reply decoded as a message
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.recv_line().await? {
            Some(line) => Ok(Some(Message::decode(line.as_bytes())?)),
            None => Ok(None),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Connect, send `message` twice and print what comes back
pub async fn run_client(message: &str, host: &str, port: u16) -> Result<()> {
    let (mut client, greeting) = Client::connect((host, port)).await?;
    println!("Version message: {}", greeting.trim_end());

    for _ in 0..2 {
        println!("Send: {:?}", message);
        client.send_line(message).await?;

        match client.recv_line().await? {
            Some(reply) => println!("Received: {:?}", reply),
            None => {
                println!("Connection closed by server");
                return Ok(());
            }
        }

        tokio::time::sleep(SEND_INTERVAL).await;
    }

    println!("Closing the connection");
    client.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::version_line;
    use crate::daemon::registry::HandlerResult;
    use crate::daemon::server::{Server, ServerConfig};
    use serde_json::{json, Value};
    use std::sync::Arc;

    async fn echo(_server: Arc<Server>, message: Message, _args: Value) -> HandlerResult {
        Ok(message)
    }

    #[tokio::test]
    async fn test_client_roundtrip() {
        let server = Server::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        });
        server.register("hello", echo);
        let (addr, _serve) = server.start().await.unwrap();

        let (mut client, greeting) = Client::connect(addr).await.unwrap();
        assert_eq!(greeting, version_line());

        let request = Message::new("client-1", "hello", json!({"planet": "world"}));
        client.send(&request).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Some(request));

        client.send_line("garbage").await.unwrap();
        client
            .send_line(r#"{"cli": "client-1", "cmd": "hello", "dta": {}}"#)
            .await
            .unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.data, json!({}));

        client.close().await.unwrap();
        server.stop().await;
    }
}
