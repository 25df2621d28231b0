/**
 * DÉCODEUR DE TRAMES PLC
 *
 * RÔLE : Transformer une lecture TCP brute en suite de WORDs 16 bits.
 *
 * FONCTIONNEMENT :
 * - Chaque lecture est une trame autonome, adresses 0..n depuis son début
 * - WORD i = octets [2i, 2i+1] en big-endian
 * - Un octet final impair est ignoré (pas une erreur)
 * - Aucun état entre deux appels : pas de réassemblage
 */

use crate::models::{WordAddress, WordSample, WORD_BITS};
use std::net::SocketAddr;
use time::OffsetDateTime;

/// Décode une trame en échantillons, par adresse croissante
pub fn decode_frame(frame: &[u8], captured_at: OffsetDateTime, source: SocketAddr) -> Vec<WordSample> {
    frame
        .chunks_exact(2)
        .enumerate()
        .map(|(index, pair)| WordSample {
            address: index as WordAddress,
            value: u16::from_be_bytes([pair[0], pair[1]]),
            captured_at,
            source,
        })
        .collect()
}

/// Vrai si la trame se termine par un octet orphelin
pub fn has_trailing_byte(frame: &[u8]) -> bool {
    frame.len() % 2 == 1
}

/// Lit un bit ; un index hors 0..16 vaut toujours faux
pub fn bit_is_set(value: u16, bit: u8) -> bool {
    bit < WORD_BITS && value & (1u16 << bit) != 0
}

/// Retourne `value` avec le bit positionné ou effacé
pub fn with_bit(value: u16, bit: u8, on: bool) -> u16 {
    if bit >= WORD_BITS {
        return value;
    }
    if on {
        value | (1u16 << bit)
    } else {
        value & !(1u16 << bit)
    }
}

/// Index des bits à 1, croissants
pub fn active_bits(value: u16) -> impl Iterator<Item = u8> {
    (0..WORD_BITS).filter(move |bit| value & (1u16 << *bit) != 0)
}
