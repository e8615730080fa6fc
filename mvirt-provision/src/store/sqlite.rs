use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use crate::model::{Machine, MachineStatus, Network, Storage};

use super::error::{Result, StoreError};
use super::traits::{
    CreateMachineRecord, CreateNetworkRecord, CreateStorageRecord, MachineStore, NetworkStore,
    StorageStore,
};

/// SQLite-backed record store for machines, storage and networks
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("provision.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS networks (
                id TEXT PRIMARY KEY,
                mac TEXT NOT NULL,
                network TEXT NOT NULL,
                model TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS storages (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                location TEXT NOT NULL,
                format TEXT NOT NULL,
                size_mb INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,
                initialized INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS storages_location ON storages (location)")
            .execute(&self.pool)
            .await?;

        // Generated names rely on the unique index when two writers race.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS machines (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                machine_type TEXT NOT NULL,
                arch TEXT NOT NULL,
                memory_mb INTEGER NOT NULL,
                cpus INTEGER NOT NULL,
                status TEXT NOT NULL,
                network_id TEXT REFERENCES networks(id),
                started_at TEXT,
                stopped_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (machine_type, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS machine_storage (
                machine_id TEXT NOT NULL REFERENCES machines(id) ON DELETE CASCADE,
                storage_id TEXT NOT NULL REFERENCES storages(id),
                position INTEGER NOT NULL,
                PRIMARY KEY (machine_id, position)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn storage_ids(&self, machine_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT storage_id FROM machine_storage WHERE machine_id = ? ORDER BY position",
        )
        .bind(machine_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("storage_id")).collect())
    }

    async fn load_machine(&self, row: SqliteRow) -> Result<Machine> {
        let mut machine = row_to_machine(&row)?;
        machine.storage_ids = self.storage_ids(&machine.id).await?;
        Ok(machine)
    }
}

#[async_trait]
impl MachineStore for SqliteStore {
    async fn create_machine(&self, req: CreateMachineRecord) -> Result<Machine> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO machines (id, name, machine_type, arch, memory_mb, cpus, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.name)
        .bind(&req.machine_type)
        .bind(&req.arch)
        .bind(req.memory_mb as i64)
        .bind(req.cpus as i64)
        .bind(req.status.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_or_database(e, || {
                format!("machine '{}' of type '{}' exists", req.name, req.machine_type)
            })
        })?;

        Ok(Machine {
            id,
            name: req.name,
            machine_type: req.machine_type,
            arch: req.arch,
            memory_mb: req.memory_mb,
            cpus: req.cpus,
            status: req.status,
            started_at: None,
            stopped_at: None,
            storage_ids: Vec::new(),
            network_id: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    async fn get_machine(&self, id: &str) -> Result<Option<Machine>> {
        let row = sqlx::query("SELECT * FROM machines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.load_machine(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_machine_by_name(
        &self,
        machine_type: &str,
        name: &str,
    ) -> Result<Option<Machine>> {
        let row = sqlx::query("SELECT * FROM machines WHERE machine_type = ? AND name = ?")
            .bind(machine_type)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.load_machine(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_machines(&self) -> Result<Vec<Machine>> {
        let rows = sqlx::query("SELECT * FROM machines ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        let mut machines = Vec::with_capacity(rows.len());
        for row in rows {
            machines.push(self.load_machine(row).await?);
        }
        Ok(machines)
    }

    async fn count_machines_by_type(&self, machine_type: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM machines WHERE machine_type = ?")
            .bind(machine_type)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get::<i64, _>("count") as u64)
    }

    async fn attach_storage(&self, machine_id: &str, storage_ids: &[String]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE machines SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(machine_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("machine {machine_id}")));
        }

        for (position, storage_id) in storage_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO machine_storage (machine_id, storage_id, position) VALUES (?, ?, ?)",
            )
            .bind(machine_id)
            .bind(storage_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn attach_network(&self, machine_id: &str, network_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("UPDATE machines SET network_id = ?, updated_at = ? WHERE id = ?")
            .bind(network_id)
            .bind(&now)
            .bind(machine_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("machine {machine_id}")));
        }
        Ok(())
    }

    async fn update_machine_status(&self, id: &str, status: MachineStatus) -> Result<Machine> {
        let now = Utc::now().to_rfc3339();
        let started_at = (status == MachineStatus::Running).then(|| now.clone());
        let stopped_at = (status == MachineStatus::Stopped).then(|| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE machines
            SET status = ?, started_at = COALESCE(?, started_at),
                stopped_at = COALESCE(?, stopped_at), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(started_at)
        .bind(stopped_at)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("machine {id}")));
        }

        self.get_machine(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("machine {id}")))
    }
}

#[async_trait]
impl StorageStore for SqliteStore {
    async fn create_storage(&self, req: CreateStorageRecord) -> Result<Storage> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO storages (id, name, location, format, size_mb, active, initialized, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.name)
        .bind(&req.location)
        .bind(&req.format)
        .bind(req.size_mb as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(Storage {
            id,
            name: req.name,
            location: req.location,
            format: req.format,
            size_mb: req.size_mb,
            active: false,
            initialized: false,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    async fn get_storage(&self, id: &str) -> Result<Option<Storage>> {
        let row = sqlx::query("SELECT * FROM storages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_storage))
    }

    async fn list_storage(&self) -> Result<Vec<Storage>> {
        let rows = sqlx::query("SELECT * FROM storages ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_storage).collect())
    }

    async fn list_storage_by_location(&self, location: &str) -> Result<Vec<Storage>> {
        let rows = sqlx::query("SELECT * FROM storages WHERE location = ? ORDER BY created_at")
            .bind(location)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_storage).collect())
    }

    async fn save_storage(&self, storage: &Storage) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE storages
            SET name = ?, location = ?, format = ?, size_mb = ?, initialized = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&storage.name)
        .bind(&storage.location)
        .bind(&storage.format)
        .bind(storage.size_mb as i64)
        .bind(storage.initialized)
        .bind(&now)
        .bind(&storage.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("storage {}", storage.id)));
        }
        Ok(())
    }

    async fn activate_storage(&self, id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result =
            sqlx::query("UPDATE storages SET active = 1, updated_at = ? WHERE id = ? AND active = 0")
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Zero rows: either already active or missing.
        match self.get_storage(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("storage {id}"))),
        }
    }

    async fn deactivate_storage(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("UPDATE storages SET active = 0, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("storage {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkStore for SqliteStore {
    async fn create_network(&self, req: CreateNetworkRecord) -> Result<Network> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO networks (id, mac, network, model, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&req.mac)
        .bind(&req.network)
        .bind(&req.model)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(Network {
            id,
            mac: req.mac,
            network: req.network,
            model: req.model,
            created_at: now,
        })
    }

    async fn get_network(&self, id: &str) -> Result<Option<Network>> {
        let row = sqlx::query("SELECT * FROM networks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_network))
    }

    async fn list_networks(&self) -> Result<Vec<Network>> {
        let rows = sqlx::query("SELECT * FROM networks ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_network).collect())
    }
}

fn conflict_or_database(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    let unique = err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if unique {
        StoreError::Conflict(what())
    } else {
        StoreError::Database(err)
    }
}

fn row_to_machine(r: &SqliteRow) -> Result<Machine> {
    let status: String = r.get("status");

    Ok(Machine {
        id: r.get("id"),
        name: r.get("name"),
        machine_type: r.get("machine_type"),
        arch: r.get("arch"),
        memory_mb: r.get::<i64, _>("memory_mb") as u64,
        cpus: r.get::<i64, _>("cpus") as u32,
        status: status.parse().map_err(StoreError::Internal)?,
        started_at: r.get("started_at"),
        stopped_at: r.get("stopped_at"),
        storage_ids: Vec::new(),
        network_id: r.get("network_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn row_to_storage(r: &SqliteRow) -> Storage {
    Storage {
        id: r.get("id"),
        name: r.get("name"),
        location: r.get("location"),
        format: r.get("format"),
        size_mb: r.get::<i64, _>("size_mb") as u64,
        active: r.get("active"),
        initialized: r.get("initialized"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn row_to_network(r: &SqliteRow) -> Network {
    Network {
        id: r.get("id"),
        mac: r.get("mac"),
        network: r.get("network"),
        model: r.get("model"),
        created_at: r.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path()).await.unwrap();
        (store, dir)
    }

    fn storage_req(name: &str) -> CreateStorageRecord {
        CreateStorageRecord {
            name: name.to_string(),
            location: format!("/vm/images/{name}10MBqcow2"),
            format: "qcow2".to_string(),
            size_mb: 10,
        }
    }

    fn machine_req(name: &str, machine_type: &str) -> CreateMachineRecord {
        CreateMachineRecord {
            name: name.to_string(),
            machine_type: machine_type.to_string(),
            arch: "x86_64".to_string(),
            memory_mb: 1024,
            cpus: 1,
            status: MachineStatus::Installing,
        }
    }

    #[tokio::test]
    async fn test_storage_crud() {
        let (store, _dir) = setup_store().await;

        let storage = store.create_storage(storage_req("alpha")).await.unwrap();
        assert!(!storage.active);
        assert!(!storage.initialized);

        let mut fetched = store.get_storage(&storage.id).await.unwrap().unwrap();
        assert_eq!(fetched.location, "/vm/images/alpha10MBqcow2");

        fetched.initialized = true;
        store.save_storage(&fetched).await.unwrap();
        let fetched = store.get_storage(&storage.id).await.unwrap().unwrap();
        assert!(fetched.initialized);
        assert!(!fetched.active);

        let by_location = store
            .list_storage_by_location("/vm/images/alpha10MBqcow2")
            .await
            .unwrap();
        assert_eq!(by_location.len(), 1);
        assert_eq!(store.list_storage().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_storage_keeps_active_flag() {
        let (store, _dir) = setup_store().await;

        let storage = store.create_storage(storage_req("beta")).await.unwrap();
        assert!(store.activate_storage(&storage.id).await.unwrap());

        // Stale copy still says inactive
        store.save_storage(&storage).await.unwrap();
        let fetched = store.get_storage(&storage.id).await.unwrap().unwrap();
        assert!(fetched.active);
    }

    #[tokio::test]
    async fn test_activate_storage_swaps_once() {
        let (store, _dir) = setup_store().await;

        let storage = store.create_storage(storage_req("gamma")).await.unwrap();
        assert!(store.activate_storage(&storage.id).await.unwrap());
        assert!(!store.activate_storage(&storage.id).await.unwrap());

        store.deactivate_storage(&storage.id).await.unwrap();
        assert!(store.activate_storage(&storage.id).await.unwrap());

        let missing = store.activate_storage("does-not-exist").await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_machine_name_unique_per_type() {
        let (store, _dir) = setup_store().await;

        store
            .create_machine(machine_req("web", "nix"))
            .await
            .unwrap();
        store
            .create_machine(machine_req("web", "win"))
            .await
            .unwrap();

        let dup = store.create_machine(machine_req("web", "nix")).await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));

        assert_eq!(store.count_machines_by_type("nix").await.unwrap(), 1);
        assert_eq!(store.count_machines_by_type("win").await.unwrap(), 1);
        assert_eq!(store.count_machines_by_type("bsd").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_attach_keeps_order() {
        let (store, _dir) = setup_store().await;

        let a = store.create_storage(storage_req("a")).await.unwrap();
        let b = store.create_storage(storage_req("b")).await.unwrap();
        let c = store.create_storage(storage_req("c")).await.unwrap();
        let network = store
            .create_network(CreateNetworkRecord {
                mac: "52:54:00:12:34:56".to_string(),
                network: "br0".to_string(),
                model: "virtio".to_string(),
            })
            .await
            .unwrap();

        let machine = store
            .create_machine(machine_req("db", "nix"))
            .await
            .unwrap();
        let ids = vec![c.id.clone(), a.id.clone(), b.id.clone()];
        store.attach_storage(&machine.id, &ids).await.unwrap();
        store
            .attach_network(&machine.id, &network.id)
            .await
            .unwrap();

        let fetched = store
            .get_machine_by_name("nix", "db")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.storage_ids, ids);
        assert_eq!(fetched.network_id, Some(network.id));
        assert_eq!(fetched.status, MachineStatus::Installing);
    }

    #[tokio::test]
    async fn test_update_machine_status() {
        let (store, _dir) = setup_store().await;

        let machine = store
            .create_machine(machine_req("app", "nix"))
            .await
            .unwrap();
        assert!(machine.started_at.is_none());

        let running = store
            .update_machine_status(&machine.id, MachineStatus::Running)
            .await
            .unwrap();
        assert_eq!(running.status, MachineStatus::Running);
        assert!(running.started_at.is_some());
        assert!(running.stopped_at.is_none());

        let failed = store
            .update_machine_status(&machine.id, MachineStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.status, MachineStatus::Failed);
        assert_eq!(failed.started_at, running.started_at);

        let missing = store
            .update_machine_status("nope", MachineStatus::Failed)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }
}
