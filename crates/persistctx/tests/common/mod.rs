//! Shared entities and fixtures for the integration tests.

#![allow(dead_code)]

use persistctx::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: Option<i64>,
    pub name: String,
    pub age: Option<i32>,
}

impl Person {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            age: None,
        }
    }

    pub fn aged(name: &str, age: i32) -> Self {
        Self {
            age: Some(age),
            ..Self::new(name)
        }
    }
}

impl Entity for Person {
    const ENTITY_NAME: &'static str = "Person";
    const TABLE_NAME: &'static str = "person";
    const KEY_COLUMN: &'static str = "id";
    const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequence;

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id").primary_key(true),
            FieldInfo::new("name"),
            FieldInfo::new("age").nullable(true),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("age", self.age.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            age: row.get_named("age")?,
        })
    }

    fn primary_key_value(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_primary_key(&mut self, key: Value) -> Result<()> {
        self.id = Some(i64::try_from(key)?);
        Ok(())
    }
}

#[derive(Debug)]
pub struct Team {
    pub id: i64,
    pub name: String,
}

impl Entity for Team {
    const ENTITY_NAME: &'static str = "Team";
    const TABLE_NAME: &'static str = "team";
    const KEY_COLUMN: &'static str = "id";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id").primary_key(true),
            FieldInfo::new("name"),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }

    fn primary_key_value(&self) -> Option<Value> {
        Some(Value::BigInt(self.id))
    }

    fn set_primary_key(&mut self, key: Value) -> Result<()> {
        self.id = i64::try_from(key)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Player {
    pub id: Option<i64>,
    pub name: String,
    pub team: Lazy<Team>,
}

impl Player {
    pub fn new(name: &str, team: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            team: Lazy::from_key(team),
        }
    }
}

impl Entity for Player {
    const ENTITY_NAME: &'static str = "Player";
    const TABLE_NAME: &'static str = "player";
    const KEY_COLUMN: &'static str = "id";
    const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequence;
    const ASSOCIATIONS: &'static [AssociationInfo] =
        &[AssociationInfo::new("team", "team", "team_id")];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id").primary_key(true),
            FieldInfo::new("name"),
            FieldInfo::new("team_id").nullable(true).references("team"),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("team_id", self.team.key_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        let team: Option<i64> = row.get_named("team_id")?;
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            team: Lazy::from_key(team),
        })
    }

    fn primary_key_value(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_primary_key(&mut self, key: Value) -> Result<()> {
        self.id = Some(i64::try_from(key)?);
        Ok(())
    }
}

/// Backend with empty tables for every test entity.
pub fn empty_backend() -> MemoryBackend {
    let mut backend = MemoryBackend::new();
    backend.create_table::<Person>().unwrap();
    backend.create_table::<Team>().unwrap();
    backend.create_table::<Player>().unwrap();
    backend
}

/// Two teams, four players (one without a team) and three people.
pub fn seeded_backend() -> MemoryBackend {
    let mut backend = empty_backend();
    for (id, name) in [(1, "Reds"), (2, "Blues")] {
        backend
            .seed(&Team {
                id,
                name: name.to_string(),
            })
            .unwrap();
    }
    for (id, name, team) in [
        (1, "ann", Some(1)),
        (2, "bob", Some(2)),
        (3, "cyd", None),
        (4, "dee", Some(1)),
    ] {
        let mut player = Player::new(name, team);
        player.id = Some(id);
        backend.seed(&player).unwrap();
    }
    for (id, name, age) in [(1, "alice", 34), (2, "bruno", 17), (3, "carla", 25)] {
        backend
            .seed(&Person {
                id: Some(id),
                name: name.to_string(),
                age: Some(age),
            })
            .unwrap();
    }
    backend
}

pub fn context(backend: MemoryBackend) -> PersistenceContext<MemoryBackend> {
    PersistenceContext::new(backend)
}

/// Column values of every INSERT in the backend log, in order.
pub fn inserts(backend: &MemoryBackend) -> Vec<Vec<(String, Value)>> {
    backend
        .statements()
        .iter()
        .filter_map(|s| match s {
            persistctx::Statement::Insert(insert) => Some(insert.values.clone()),
            _ => None,
        })
        .collect()
}
