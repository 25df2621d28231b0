/*!
Fixtures de définitions de falhas/eventos

- `DefinitionBuilder` : construction fluide d'une définition
- `lock_fixture()` : table réaliste d'une eclusa (enchimento, esvaziamento, portas)
- `write_seed_file()` : écrit une table au format du fichier seed du kernel
*/

use anyhow::Result;
use eclusa_kernel::models::{FaultDefinition, WordAddress};
use std::path::Path;

pub struct DefinitionBuilder {
    def: FaultDefinition,
}

impl DefinitionBuilder {
    pub fn new(id: i64, word: WordAddress, bit: u8) -> Self {
        Self {
            def: FaultDefinition {
                id,
                word,
                bit,
                code: format!("W{word}_B{bit}"),
                kind: "EVENTO_SISTEMA".into(),
                description: format!("Bit {bit} da word {word}"),
                priority: "MEDIA".into(),
                message_class: None,
                sector_code: "GERAL".into(),
                sector_name: "Geral".into(),
                lock_code: "ECL01".into(),
                lock_name: Some("Eclusa 01".into()),
                active: true,
            },
        }
    }

    pub fn code(mut self, code: &str) -> Self {
        self.def.code = code.into();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.def.description = description.into();
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.def.kind = kind.into();
        self
    }

    /// Falha critique, priorité ALTA
    pub fn critical(self) -> Self {
        self.kind("FALHA_CRITICA").priority("ALTA")
    }

    pub fn priority(mut self, priority: &str) -> Self {
        self.def.priority = priority.into();
        self
    }

    pub fn message_class(mut self, class: &str) -> Self {
        self.def.message_class = Some(class.into());
        self
    }

    pub fn sector(mut self, code: &str, name: &str) -> Self {
        self.def.sector_code = code.into();
        self.def.sector_name = name.into();
        self
    }

    pub fn lock(mut self, code: &str, name: Option<&str>) -> Self {
        self.def.lock_code = code.into();
        self.def.lock_name = name.map(Into::into);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.def.active = false;
        self
    }

    pub fn build(self) -> FaultDefinition {
        self.def
    }
}

/// Table de référence utilisée par le harness et le simulateur
pub fn lock_fixture() -> Vec<FaultDefinition> {
    vec![
        DefinitionBuilder::new(1, 0, 0)
            .code("ENC_VALVULA_01_ABERTA")
            .description("Valvula de enchimento 01 aberta")
            .sector("ENCHIMENTO", "Enchimento")
            .build(),
        DefinitionBuilder::new(2, 0, 1)
            .code("ENC_SENSOR_NIVEL")
            .description("Sensor de nivel de enchimento atuado")
            .sector("ENCHIMENTO", "Enchimento")
            .build(),
        DefinitionBuilder::new(3, 1, 0)
            .code("ESV_VALVULA_01_ABERTA")
            .description("Valvula de esvaziamento 01 aberta")
            .sector("ESVAZIAMENTO", "Esvaziamento")
            .build(),
        DefinitionBuilder::new(4, 2, 0)
            .code("PJ_ABERTA")
            .description("Porta jusante aberta")
            .sector("PORTA_JUSANTE", "Porta Jusante")
            .build(),
        DefinitionBuilder::new(5, 2, 1)
            .code("PJ_FECHADA")
            .description("Porta jusante fechada")
            .sector("PORTA_JUSANTE", "Porta Jusante")
            .build(),
        DefinitionBuilder::new(6, 3, 0)
            .code("PM_ABERTA")
            .description("Porta montante aberta")
            .sector("PORTA_MONTANTE", "Porta Montante")
            .build(),
        DefinitionBuilder::new(7, 10, 0)
            .code("F_ENC_VALVULA")
            .description("Falha na valvula de enchimento")
            .sector("ENCHIMENTO", "Enchimento")
            .critical()
            .message_class("ALARME")
            .build(),
        DefinitionBuilder::new(8, 11, 0)
            .code("F_ESV_VALVULA")
            .description("Falha na valvula de esvaziamento")
            .sector("ESVAZIAMENTO", "Esvaziamento")
            .critical()
            .message_class("ALARME")
            .build(),
        DefinitionBuilder::new(9, 11, 3)
            .code("F_ESV_SOBRECORRENTE")
            .description("Sobrecorrente no motor de esvaziamento")
            .sector("ESVAZIAMENTO", "Esvaziamento")
            .kind("FALHA_OPERACIONAL")
            .priority("ALTA")
            .build(),
    ]
}

/// Écrit des définitions au format YAML lu par `store.seed_file`
pub fn write_seed_file(definitions: &[FaultDefinition], path: impl AsRef<Path>) -> Result<()> {
    let yaml = serde_yaml::to_string(definitions)?;
    std::fs::write(path.as_ref(), yaml)?;
    log::info!("🌱 Wrote {} definitions to {}", definitions.len(), path.as_ref().display());
    Ok(())
}
