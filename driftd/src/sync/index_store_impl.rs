impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            temp_available: Mutex::new(HashMap::new()),
        }
    }

    pub async fn new(database_url: &str) -> Result<Self, IndexError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, IndexError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Install new local records, assigning each a fresh `local_version`
    /// from the device's sequence, and keep the block finder in step.
    pub async fn update_locals(
        &self,
        folder: &str,
        device: &DeviceId,
        files: &[FileInfo],
    ) -> Result<(), IndexError> {
        if files.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT seq FROM local_sequence WHERE folder = ?1 AND device = ?2")
            .bind(folder)
            .bind(device.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let mut seq: i64 = match row {
            Some(row) => row.try_get("seq")?,
            None => 0,
        };

        for file in files {
            seq += 1;
            upsert_file(&mut tx, folder, device, file, seq).await?;

            sqlx::query("DELETE FROM block_map WHERE folder = ?1 AND name = ?2")
                .bind(folder)
                .bind(&file.name)
                .execute(&mut *tx)
                .await?;
            if !file.deleted && !file.invalid && file.kind == FileKind::File {
                for (idx, block) in file.blocks.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO block_map (folder, name, idx, hash) VALUES (?1, ?2, ?3, ?4)",
                    )
                    .bind(folder)
                    .bind(&file.name)
                    .bind(idx as i64)
                    .bind(block.hash.clone())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        upsert_sequence(&mut tx, folder, device, seq).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Ingest a peer's index records, keeping the `local_version` the
    /// peer assigned so it can serve as a change watermark.
    pub async fn update_remotes(
        &self,
        folder: &str,
        device: &DeviceId,
        files: &[FileInfo],
    ) -> Result<(), IndexError> {
        if files.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT seq FROM local_sequence WHERE folder = ?1 AND device = ?2")
            .bind(folder)
            .bind(device.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let mut seq: i64 = match row {
            Some(row) => row.try_get("seq")?,
            None => 0,
        };

        for file in files {
            seq = seq.max(file.local_version);
            upsert_file(&mut tx, folder, device, file, file.local_version).await?;
        }

        upsert_sequence(&mut tx, folder, device, seq).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn current_folder_file(
        &self,
        folder: &str,
        device: &DeviceId,
        name: &str,
    ) -> Result<Option<FileInfo>, IndexError> {
        let row = sqlx::query(
            "SELECT device, name, kind, flags, modified, size, deleted, invalid, version, local_version, blocks
             FROM files WHERE folder = ?1 AND device = ?2 AND name = ?3",
        )
        .bind(folder)
        .bind(device.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_file(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn current_global_file(
        &self,
        folder: &str,
        name: &str,
    ) -> Result<Option<FileInfo>, IndexError> {
        let rows = sqlx::query(
            "SELECT device, name, kind, flags, modified, size, deleted, invalid, version, local_version, blocks
             FROM files WHERE folder = ?1 AND name = ?2",
        )
        .bind(folder)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let device: String = row.try_get("device")?;
            records.push((DeviceId::new(device), row_to_file(row)?));
        }
        Ok(global_of(&records))
    }

    /// The needed files for `device`, in lexicographic name order, from a
    /// snapshot taken at call time.
    pub async fn need(
        &self,
        folder: &str,
        device: &DeviceId,
    ) -> Result<Vec<FileInfo>, IndexError> {
        let rows = sqlx::query(
            "SELECT device, name, kind, flags, modified, size, deleted, invalid, version, local_version, blocks
             FROM files WHERE folder = ?1 ORDER BY name, device",
        )
        .bind(folder)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        let mut records: Vec<(DeviceId, FileInfo)> = Vec::new();
        let mut current_name: Option<String> = None;

        for row in &rows {
            let row_device: String = row.try_get("device")?;
            let file = row_to_file(row)?;
            if current_name.as_deref() != Some(file.name.as_str()) {
                if let Some(needed) = need_of(&records, device) {
                    out.push(needed);
                }
                records.clear();
                current_name = Some(file.name.clone());
            }
            records.push((DeviceId::new(row_device), file));
        }
        if let Some(needed) = need_of(&records, device) {
            out.push(needed);
        }

        Ok(out)
    }

    /// Visit the needed files in order; the visitor returns `false` to
    /// stop early. The iteration sees a snapshot taken at call time.
    pub async fn with_need<F>(
        &self,
        folder: &str,
        device: &DeviceId,
        mut visit: F,
    ) -> Result<(), IndexError>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        for file in self.need(folder, device).await? {
            if !visit(&file) {
                break;
            }
        }
        Ok(())
    }

    /// The highest `local_version` seen from any remote device: a cheap
    /// ticker that advances whenever a peer index changes.
    pub async fn remote_local_version(
        &self,
        folder: &str,
        local: &DeviceId,
    ) -> Result<i64, IndexError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) AS seq FROM local_sequence
             WHERE folder = ?1 AND device != ?2",
        )
        .bind(folder)
        .bind(local.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("seq")?)
    }

    /// Peers believed to hold the given block of `name` at `version`:
    /// devices whose record sits at exactly that version, plus devices
    /// advertising the block from an in-progress temp file.
    pub async fn availability(
        &self,
        folder: &str,
        name: &str,
        version: &Vector,
        block: &BlockInfo,
        local: &DeviceId,
    ) -> Result<Vec<Availability>, IndexError> {
        let rows = sqlx::query(
            "SELECT device, name, kind, flags, modified, size, deleted, invalid, version, local_version, blocks
             FROM files WHERE folder = ?1 AND name = ?2 AND device != ?3",
        )
        .bind(folder)
        .bind(name)
        .bind(local.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in &rows {
            let device: String = row.try_get("device")?;
            let file = row_to_file(row)?;
            if file.deleted || file.invalid {
                continue;
            }
            if file.version.compare(version) == VectorOrdering::Equal {
                out.push(Availability {
                    device: DeviceId::new(device),
                    from_temporary: false,
                });
            }
        }

        let temp = self.temp_available.lock().expect("temp map mutex poisoned");
        if let Some(devices) = temp.get(&(folder.to_string(), name.to_string())) {
            let idx = block_index(block);
            for (device, indices) in devices {
                if device == local || !indices.contains(&idx) {
                    continue;
                }
                if out.iter().any(|a| a.device == *device) {
                    continue;
                }
                out.push(Availability {
                    device: device.clone(),
                    from_temporary: true,
                });
            }
        }

        Ok(out)
    }

    /// Record which block indices a peer's in-progress temp file holds
    /// for `name`. An empty list clears the entry.
    pub fn set_temp_availability(
        &self,
        folder: &str,
        device: &DeviceId,
        name: &str,
        indices: Vec<u32>,
    ) {
        let mut temp = self.temp_available.lock().expect("temp map mutex poisoned");
        let key = (folder.to_string(), name.to_string());
        if indices.is_empty() {
            if let Some(devices) = temp.get_mut(&key) {
                devices.remove(device);
                if devices.is_empty() {
                    temp.remove(&key);
                }
            }
            return;
        }
        temp.entry(key)
            .or_default()
            .insert(device.clone(), indices.into_iter().collect());
    }

    /// Local places where a block with this hash is recorded, limited to
    /// the given folders.
    pub async fn finder_candidates(
        &self,
        folders: &[String],
        hash: &[u8],
    ) -> Result<Vec<BlockLocation>, IndexError> {
        if folders.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = folders
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT folder, name, idx FROM block_map
             WHERE hash = ?1 AND folder IN ({placeholders})
             ORDER BY folder, name, idx"
        );
        let mut query = sqlx::query(&sql).bind(hash.to_vec());
        for folder in folders {
            query = query.bind(folder);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let idx: i64 = row.try_get("idx")?;
            out.push(BlockLocation {
                folder: row.try_get("folder")?,
                name: row.try_get("name")?,
                index: idx as u32,
            });
        }
        Ok(out)
    }

    /// Visit candidate block locations; the visitor returns `true` once
    /// it has verified and used one, stopping the iteration. Returns
    /// whether any visit succeeded.
    pub async fn finder_iterate<F>(
        &self,
        folders: &[String],
        hash: &[u8],
        mut visit: F,
    ) -> Result<bool, IndexError>
    where
        F: FnMut(&BlockLocation) -> bool,
    {
        for location in self.finder_candidates(folders, hash).await? {
            if visit(&location) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Correct the finder after a block on disk failed verification:
    /// replace the expected hash with what was actually observed.
    pub async fn finder_fix(
        &self,
        folder: &str,
        name: &str,
        index: u32,
        expected: &[u8],
        observed: &[u8],
    ) -> Result<(), IndexError> {
        sqlx::query(
            "UPDATE block_map SET hash = ?1
             WHERE folder = ?2 AND name = ?3 AND idx = ?4 AND hash = ?5",
        )
        .bind(observed.to_vec())
        .bind(folder)
        .bind(name)
        .bind(index as i64)
        .bind(expected.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The authoritative mtime for a file: the recorded intention when
    /// the filesystem refused to apply it, the observed value otherwise.
    pub async fn mtime_for(
        &self,
        folder: &str,
        name: &str,
        observed: i64,
    ) -> Result<i64, IndexError> {
        let row = sqlx::query(
            "SELECT observed, intended FROM virtual_mtimes WHERE folder = ?1 AND name = ?2",
        )
        .bind(folder)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let recorded: i64 = row.try_get("observed")?;
            if recorded == observed {
                return Ok(row.try_get("intended")?);
            }
        }
        Ok(observed)
    }

    pub async fn update_mtime(
        &self,
        folder: &str,
        name: &str,
        observed: i64,
        intended: i64,
    ) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO virtual_mtimes (folder, name, observed, intended)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(folder, name) DO UPDATE SET
                observed = excluded.observed,
                intended = excluded.intended",
        )
        .bind(folder)
        .bind(name)
        .bind(observed)
        .bind(intended)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn virtual_mtimes(
        &self,
        folder: &str,
    ) -> Result<HashMap<String, (i64, i64)>, IndexError> {
        let rows =
            sqlx::query("SELECT name, observed, intended FROM virtual_mtimes WHERE folder = ?1")
                .bind(folder)
                .fetch_all(&self.pool)
                .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("name")?;
            out.insert(name, (row.try_get("observed")?, row.try_get("intended")?));
        }
        Ok(out)
    }

    /// All records one device holds for a folder, in name order.
    pub async fn local_files(
        &self,
        folder: &str,
        device: &DeviceId,
    ) -> Result<Vec<FileInfo>, IndexError> {
        let rows = sqlx::query(
            "SELECT device, name, kind, flags, modified, size, deleted, invalid, version, local_version, blocks
             FROM files WHERE folder = ?1 AND device = ?2 ORDER BY name",
        )
        .bind(folder)
        .bind(device.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(row_to_file(row)?);
        }
        Ok(out)
    }
}

fn need_of(records: &[(DeviceId, FileInfo)], device: &DeviceId) -> Option<FileInfo> {
    let global = global_of(records)?;
    let local = records.iter().find(|(dev, _)| dev == device);
    match local {
        None => {
            // Nothing to do for a deletion we never had.
            if global.deleted { None } else { Some(global) }
        }
        Some((_, local)) => {
            if global.version.compare(&local.version) == VectorOrdering::Equal {
                None
            } else {
                Some(global)
            }
        }
    }
}

async fn upsert_file(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    folder: &str,
    device: &DeviceId,
    file: &FileInfo,
    local_version: i64,
) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO files (
            folder, device, name, kind, flags, modified, size,
            deleted, invalid, version, local_version, blocks
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(folder, device, name) DO UPDATE SET
            kind = excluded.kind,
            flags = excluded.flags,
            modified = excluded.modified,
            size = excluded.size,
            deleted = excluded.deleted,
            invalid = excluded.invalid,
            version = excluded.version,
            local_version = excluded.local_version,
            blocks = excluded.blocks",
    )
    .bind(folder)
    .bind(device.as_str())
    .bind(&file.name)
    .bind(file.kind.as_str())
    .bind(file.flags as i64)
    .bind(file.modified)
    .bind(file.size as i64)
    .bind(file.deleted)
    .bind(file.invalid)
    .bind(serde_json::to_string(&file.version)?)
    .bind(local_version)
    .bind(serde_json::to_string(&file.blocks)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_sequence(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    folder: &str,
    device: &DeviceId,
    seq: i64,
) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO local_sequence (folder, device, seq) VALUES (?1, ?2, ?3)
         ON CONFLICT(folder, device) DO UPDATE SET seq = excluded.seq",
    )
    .bind(folder)
    .bind(device.as_str())
    .bind(seq)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> Result<FileInfo, IndexError> {
    let kind: String = row.try_get("kind")?;
    let flags: i64 = row.try_get("flags")?;
    let size: i64 = row.try_get("size")?;
    let version: String = row.try_get("version")?;
    let blocks: String = row.try_get("blocks")?;
    Ok(FileInfo {
        name: row.try_get("name")?,
        kind: FileKind::parse(&kind)?,
        flags: flags as u32,
        modified: row.try_get("modified")?,
        size: size as u64,
        deleted: row.try_get("deleted")?,
        invalid: row.try_get("invalid")?,
        version: serde_json::from_str(&version)?,
        local_version: row.try_get("local_version")?,
        blocks: serde_json::from_str(&blocks)?,
    })
}
