/**
 * ECLUSA PLC SIM - Automate simulé pour développement
 *
 * RÔLE : Se connecte au kernel et envoie périodiquement une trame de WORDs.
 * À chaque tick un seul bit change (tous les bits sont parcourus, le passage suivant les remet à zéro),
 * ce qui produit alternativement des ouvertures et des résolutions d'occurrences.
 *
 * CONFIGURATION (variables d'environnement) :
 * - PLC_SIM_TARGET   : adresse du kernel (défaut 127.0.0.1:8502)
 * - PLC_SIM_INTERVAL : période entre trames, ex "2s", "500ms" (défaut 2s)
 * - PLC_SIM_WORDS    : nombre de WORDs par trame (défaut 12)
 *
 * En cas de perte de connexion, nouvelle tentative toutes les 5s.
 */

use anyhow::{Context, Result};
use eclusa_devkit::{FrameBuilder, PlcClient};
use std::time::Duration;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct SimConfig {
    target: String,
    interval: Duration,
    words: usize,
}

impl SimConfig {
    fn from_env() -> Result<Self> {
        let target = std::env::var("PLC_SIM_TARGET").unwrap_or_else(|_| "127.0.0.1:8502".into());
        let interval = match std::env::var("PLC_SIM_INTERVAL") {
            Ok(raw) => humantime::parse_duration(&raw).with_context(|| format!("PLC_SIM_INTERVAL invalide: {raw}"))?,
            Err(_) => Duration::from_secs(2),
        };
        let words = match std::env::var("PLC_SIM_WORDS") {
            Ok(raw) => raw.parse::<usize>().with_context(|| format!("PLC_SIM_WORDS invalide: {raw}"))?,
            Err(_) => 12,
        };
        Ok(Self { target, interval, words: words.max(1) })
    }
}

/// Position du bit basculé à chaque tick
struct BitWalker {
    frame: FrameBuilder,
    total_bits: usize,
    cursor: usize,
}

impl BitWalker {
    fn new(words: usize) -> Self {
        Self { frame: FrameBuilder::new(words), total_bits: words * 16, cursor: 0 }
    }

    /// Bascule le bit courant et avance ; renvoie (word, bit, nouvel état)
    fn step(&mut self) -> (usize, u8, bool) {
        let word = self.cursor / 16;
        let bit = (self.cursor % 16) as u8;
        let on = self.frame.words()[word] & (1 << bit) == 0;
        self.frame = std::mem::take(&mut self.frame).bit(word, bit, on);
        self.cursor = (self.cursor + 1) % self.total_bits;
        (word, bit, on)
    }
}

async fn run_session(config: &SimConfig, walker: &mut BitWalker) -> Result<()> {
    let mut plc = PlcClient::connect(config.target.as_str()).await?;
    log::info!("🏭 PLC sim connected to {} ({} words per frame)", config.target, config.words);

    let mut ticker = tokio::time::interval(config.interval);
    loop {
        ticker.tick().await;
        let (word, bit, on) = walker.step();
        plc.send_frame(&walker.frame).await?;
        log::info!("📤 W{}.{} -> {}", word, bit, if on { 1 } else { 0 });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = SimConfig::from_env()?;
    let mut walker = BitWalker::new(config.words);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 PLC sim stopped");
                return Ok(());
            }
            result = run_session(&config, &mut walker) => {
                if let Err(e) = result {
                    log::warn!("⚠️ PLC sim session ended: {:#}, retry in {:?}", e, RECONNECT_DELAY);
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walker_toggles_one_bit_per_step() {
        let mut walker = BitWalker::new(1);
        assert_eq!(walker.step(), (0, 0, true));
        assert_eq!(walker.step(), (0, 1, true));
        assert_eq!(walker.frame.words(), &[0x0003]);
    }

    #[test]
    fn test_walker_wraps_and_clears() {
        let mut walker = BitWalker::new(1);
        for _ in 0..16 {
            walker.step();
        }
        assert_eq!(walker.frame.words(), &[0xFFFF]);
        assert_eq!(walker.step(), (0, 0, false));
        assert_eq!(walker.frame.words(), &[0xFFFE]);
    }
}
