/*!
# Eclusa DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement et les tests autour du kernel avec:
- Client PLC simplifié (connexion TCP + envoi de WORDs big-endian)
- Constructeur de trames
- Fixtures de définitions de falhas/eventos
- Harness démarrant un kernel complet sur un port éphémère
*/

pub mod definition_fixtures;
pub mod plc_stub;
pub mod test_utils;

pub use definition_fixtures::{lock_fixture, write_seed_file, DefinitionBuilder};
pub use plc_stub::{FrameBuilder, PlcClient};
pub use test_utils::TestHarness;
