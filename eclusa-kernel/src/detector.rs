/**
 * DÉTECTEUR DE CHANGEMENTS DE BITS
 *
 * RÔLE : Comparer chaque WORD reçue à la dernière valeur vue à la même adresse
 * et émettre une transition par bit qui a changé.
 *
 * FONCTIONNEMENT :
 * - Adresse jamais vue : chaque bit à 1 produit un front montant (0 -> 1)
 * - Adresse connue : delta = précédent XOR nouveau, une transition par bit du delta
 * - Bits toujours parcourus 0..15, adresses dans l'ordre de la trame
 * - La valeur stockée est mise à jour même sans changement
 *
 * CONCURRENCE : une instance partagée par toutes les connexions ; une trame
 * entière est traitée sous le verrou, donc atomique vis-à-vis des autres trames.
 */

use crate::decoder::bit_is_set;
use crate::models::{BitTransition, WordAddress, WordSample, WORD_BITS};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct BitChangeDetector {
    previous: Mutex<HashMap<WordAddress, u16>>,
}

impl BitChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Traite une trame complète et retourne ses transitions, adresse puis bit croissants
    pub fn observe(&self, samples: &[WordSample]) -> Vec<BitTransition> {
        let mut previous = self.previous.lock();
        let mut transitions = Vec::new();

        for sample in samples {
            let before = previous.insert(sample.address, sample.value);
            if before.is_none() {
                tracing::debug!(word = sample.address, value = format_args!("0x{:04X}", sample.value), "first reading of word");
            }
            push_transitions(before, sample, &mut transitions);
        }

        transitions
    }

    /// Dernière valeur connue d'une adresse
    pub fn last_value(&self, address: WordAddress) -> Option<u16> {
        self.previous.lock().get(&address).copied()
    }

    /// Copie triée de la table des valeurs précédentes
    pub fn snapshot(&self) -> BTreeMap<WordAddress, u16> {
        self.previous.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn tracked_words(&self) -> usize {
        self.previous.lock().len()
    }
}

/// Une adresse inconnue se compare à 0x0000 : seuls des fronts montants sont possibles
fn push_transitions(before: Option<u16>, sample: &WordSample, out: &mut Vec<BitTransition>) {
    let old_value = before.unwrap_or(0);
    let delta = old_value ^ sample.value;
    if delta == 0 {
        return;
    }

    for bit in 0..WORD_BITS {
        if !bit_is_set(delta, bit) {
            continue;
        }
        out.push(BitTransition {
            word: sample.address,
            bit,
            old: bit_is_set(old_value, bit),
            new: bit_is_set(sample.value, bit),
            at: sample.captured_at,
            source: sample.source,
        });
    }
}
