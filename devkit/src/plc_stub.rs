/*!
Client PLC pour développement sans automate

Ouvre une connexion TCP vers le kernel et envoie des trames de WORDs 16 bits
big-endian, exactement comme le ferait le PLC de l'eclusa.
*/

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};

/// Construit une trame : WORD i à l'adresse i
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBuilder {
    words: Vec<u16>,
}

impl FrameBuilder {
    /// Trame de `count` WORDs à zéro
    pub fn new(count: usize) -> Self {
        Self { words: vec![0; count] }
    }

    pub fn from_words(words: &[u16]) -> Self {
        Self { words: words.to_vec() }
    }

    /// Agrandit la trame si l'adresse dépasse la taille actuelle
    pub fn word(mut self, address: usize, value: u16) -> Self {
        if address >= self.words.len() {
            self.words.resize(address + 1, 0);
        }
        self.words[address] = value;
        self
    }

    pub fn bit(mut self, address: usize, bit: u8, on: bool) -> Self {
        if address >= self.words.len() {
            self.words.resize(address + 1, 0);
        }
        self.words[address] = eclusa_kernel::decoder::with_bit(self.words[address], bit, on);
        self
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn build(&self) -> Vec<u8> {
        encode_words(&self.words)
    }
}

/// WORDs -> octets big-endian
pub fn encode_words(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Connexion PLC simulée
pub struct PlcClient {
    stream: TcpStream,
    peer: SocketAddr,
    frames_sent: usize,
}

impl PlcClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("PLC connect failed")?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        log::info!("🔌 [PLC] connected to {}", peer);
        Ok(Self { stream, peer, frames_sent: 0 })
    }

    pub async fn send_words(&mut self, words: &[u16]) -> Result<()> {
        self.send_raw(&encode_words(words)).await
    }

    pub async fn send_frame(&mut self, frame: &FrameBuilder) -> Result<()> {
        self.send_raw(&frame.build()).await
    }

    /// Envoie des octets tels quels (trames impaires, bruit...)
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.context("PLC write failed")?;
        self.stream.flush().await?;
        self.frames_sent += 1;
        log::debug!("📤 [PLC] sent {} bytes to {}", bytes.len(), self.peer);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent
    }

    /// Fermeture propre côté PLC (FIN)
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        log::info!("🔌 [PLC] closed connection to {}", self.peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_frame_builder_big_endian() {
        let frame = FrameBuilder::new(2).word(0, 0x0102).bit(1, 15, true).bit(1, 0, true);
        assert_eq!(frame.build(), vec![0x01, 0x02, 0x80, 0x01]);
    }

    #[test]
    fn test_frame_builder_grows() {
        let frame = FrameBuilder::new(0).bit(3, 1, true);
        assert_eq!(frame.words(), &[0, 0, 0, 0x0002]);
        assert_eq!(frame.clone().bit(3, 1, false).words(), &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_client_sends_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let mut plc = PlcClient::connect(addr).await.unwrap();
        plc.send_words(&[0x0003, 0xA5A5]).await.unwrap();
        plc.send_raw(&[0xFF]).await.unwrap();
        assert_eq!(plc.frames_sent(), 2);
        plc.close().await.unwrap();

        assert_eq!(reader.await.unwrap(), vec![0x00, 0x03, 0xA5, 0xA5, 0xFF]);
    }
}
