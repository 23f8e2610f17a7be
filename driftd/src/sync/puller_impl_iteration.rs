impl RwShared {
    /// One puller iteration: handle every file currently flagged as
    /// needed. Returns the number of items that should have been synced,
    /// failed ones included; the caller uses it for backoff.
    pub(crate) async fn puller_iteration(self: Arc<Self>) -> usize {
        let folder = self.cfg.id.clone();

        let (copy_tx, copy_rx) = mpsc::channel::<CopyBlocksState>(1);
        let (pull_tx, pull_rx) = mpsc::channel::<PullBlockState>(1);
        let (finisher_tx, finisher_rx) = mpsc::channel::<Arc<SharedPullerState>>(1);
        let (db_tx, db_rx) = mpsc::channel::<DbUpdateJob>(1);

        tracing::debug!(%folder, copiers = self.cfg.copiers(), pullers = self.cfg.pullers(), "starting iteration");

        // The db updater finishes when the db channel closes.
        let db_task = tokio::spawn({
            let shared = Arc::clone(&self);
            async move { shared.db_updater_routine(db_rx).await }
        });

        let copy_rx = Arc::new(AsyncMutex::new(copy_rx));
        let mut copy_tasks = Vec::with_capacity(self.cfg.copiers());
        for _ in 0..self.cfg.copiers() {
            let shared = Arc::clone(&self);
            let rx = Arc::clone(&copy_rx);
            let pull_tx = pull_tx.clone();
            let finisher_tx = finisher_tx.clone();
            // Each copier finishes when the copy channel closes.
            copy_tasks.push(tokio::spawn(async move {
                shared.copier_routine(rx, pull_tx, finisher_tx).await
            }));
        }

        let pull_rx = Arc::new(AsyncMutex::new(pull_rx));
        let mut pull_tasks = Vec::with_capacity(self.cfg.pullers());
        for _ in 0..self.cfg.pullers() {
            let shared = Arc::clone(&self);
            let rx = Arc::clone(&pull_rx);
            let finisher_tx = finisher_tx.clone();
            // Each puller finishes when the pull channel closes.
            pull_tasks.push(tokio::spawn(async move {
                shared.puller_routine(rx, finisher_tx).await
            }));
        }

        // The finisher finishes when the finisher channel closes.
        let finisher_task = tokio::spawn({
            let shared = Arc::clone(&self);
            let db_tx = db_tx.clone();
            async move { shared.finisher_routine(finisher_rx, db_tx).await }
        });

        // Only the copy workers feed the network stage, and only the
        // workers feed the finisher. Dropping our ends makes channel
        // closure propagate stage by stage.
        drop(pull_tx);
        drop(finisher_tx);

        let mut changed = 0usize;
        let mut file_deletions: HashMap<String, FileInfo> = HashMap::new();
        let mut dir_deletions: Vec<FileInfo> = Vec::new();
        // Local files pending deletion, bucketed by their first block
        // hash for rename detection.
        let mut buckets: HashMap<Vec<u8>, Vec<FileInfo>> = HashMap::new();

        // Needed items arrive sorted lexicographically: directories are
        // handled as they come, so parents exist before children; files
        // are queued and possibly reordered below.
        let needed = match self.ctx.store.need(&folder, &self.ctx.device_id).await {
            Ok(needed) => needed,
            Err(err) => {
                tracing::warn!(%folder, "need enumeration failed: {err}");
                Vec::new()
            }
        };

        for file in needed {
            if self.stop.is_cancelled() {
                break;
            }
            if self.matcher.match_name(&file.name).is_ignored() {
                continue;
            }
            tracing::debug!(%folder, item = %file.name, "handling");
            changed += 1;

            if file.deleted {
                if file.is_directory() {
                    dir_deletions.push(file);
                } else {
                    // The local record may already be deleted at a lower
                    // version, or be the wrong type entirely; only proper
                    // regular files can satisfy a rename.
                    if let Ok(Some(cur)) = self
                        .ctx
                        .store
                        .current_folder_file(&folder, &self.ctx.device_id, &file.name)
                        .await
                        && !cur.deleted
                        && !cur.is_symlink()
                        && !cur.is_directory()
                        && !cur.blocks.is_empty()
                    {
                        buckets
                            .entry(cur.blocks[0].hash.clone())
                            .or_default()
                            .push(cur);
                    }
                    file_deletions.insert(file.name.clone(), file);
                }
            } else if file.is_directory() && !file.is_symlink() {
                self.handle_dir(&file, &db_tx).await;
            } else {
                self.queue.push(&file.name, file.size, file.modified);
            }
        }

        match self.cfg.order {
            PullOrder::Random => self.queue.shuffle(),
            // Enumeration is already alphabetic.
            PullOrder::Alphabetic => {}
            PullOrder::SmallestFirst => self.queue.sort_smallest_first(),
            PullOrder::LargestFirst => self.queue.sort_largest_first(),
            PullOrder::OldestFirst => self.queue.sort_oldest_first(),
            PullOrder::NewestFirst => self.queue.sort_newest_first(),
        }

        'next_file: loop {
            if self.stop.is_cancelled() {
                break;
            }
            let Some(file_name) = self.queue.pop() else {
                break;
            };

            let fi = match self.ctx.store.current_global_file(&folder, &file_name).await {
                Ok(Some(fi)) => fi,
                Ok(None) => {
                    // No longer in the index; drop it.
                    self.queue.done(&file_name);
                    continue;
                }
                Err(err) => {
                    tracing::warn!(%folder, item = %file_name, "global lookup failed: {err}");
                    self.queue.done(&file_name);
                    continue;
                }
            };

            // An index update between queueing and popping may have
            // changed what the file is.
            if fi.deleted || (fi.is_directory() && !fi.is_symlink()) {
                if fi.deleted {
                    if fi.is_directory() {
                        dir_deletions.push(fi);
                    } else {
                        file_deletions.insert(fi.name.clone(), fi);
                    }
                } else {
                    self.handle_dir(&fi, &db_tx).await;
                }
                self.queue.done(&file_name);
                continue;
            }

            if !fi.is_symlink()
                && !fi.blocks.is_empty()
                && let Some(candidates) = buckets.get_mut(&fi.blocks[0].hash)
            {
                let mut renamed = false;
                for i in 0..candidates.len() {
                    if blocks_equal(&candidates[i].blocks, &fi.blocks) {
                        let candidate = candidates.swap_remove(i);
                        // The candidate is the current state of the file;
                        // the desired state with the delete bit set sits
                        // in the deletion map. Renaming satisfies both.
                        if let Some(desired) = file_deletions.remove(&candidate.name) {
                            self.rename_file(&desired, &fi, &db_tx).await;
                        }
                        self.queue.done(&file_name);
                        renamed = true;
                        break;
                    }
                }
                if renamed {
                    continue 'next_file;
                }
            }

            self.handle_file(fi, &copy_tx, &db_tx).await;
        }

        // No more input for this iteration: close the stages in order and
        // wait for each to drain.
        drop(copy_tx);
        for task in copy_tasks {
            let _ = task.await;
        }
        for task in pull_tasks {
            let _ = task.await;
        }
        let _ = finisher_task.await;

        let mut files: Vec<FileInfo> = file_deletions.into_values().collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        for file in &files {
            tracing::debug!(%folder, item = %file.name, "deleting file");
            self.delete_file(file, &db_tx).await;
        }
        // Children before parents.
        for dir in dir_deletions.iter().rev() {
            tracing::debug!(%folder, item = %dir.name, "deleting dir");
            self.delete_dir(dir, &db_tx).await;
        }

        drop(db_tx);
        let _ = db_task.await;

        changed
    }

    /// Aggregates db updates and commits them in batches no larger than
    /// 1000 items and no more delayed than 2 seconds.
    async fn db_updater_routine(&self, mut rx: mpsc::Receiver<DbUpdateJob>) {
        let mut batch: Vec<DbUpdateJob> = Vec::with_capacity(MAX_DB_BATCH_SIZE);
        let mut tick = tokio::time::interval_at(
            Instant::now() + MAX_DB_BATCH_AGE,
            MAX_DB_BATCH_AGE,
        );
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(mut job) => {
                        // The store assigns the fresh local version.
                        job.file.local_version = 0;
                        batch.push(job);
                        if batch.len() == MAX_DB_BATCH_SIZE {
                            self.flush_db_batch(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    if !batch.is_empty() {
                        self.flush_db_batch(&mut batch).await;
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.flush_db_batch(&mut batch).await;
        }
    }

    async fn flush_db_batch(&self, batch: &mut Vec<DbUpdateJob>) {
        let files: Vec<FileInfo> = batch.iter().map(|job| job.file.clone()).collect();

        let mut last_file: Option<FileInfo> = None;
        for job in batch.iter() {
            if job.file.invalid || (job.file.is_directory() && !job.file.is_symlink()) {
                continue;
            }
            if !matches!(job.kind, DbUpdateKind::HandleFile | DbUpdateKind::DeleteFile) {
                continue;
            }
            last_file = Some(job.file.clone());
        }

        match self
            .ctx
            .store
            .update_locals(&self.cfg.id, &self.ctx.device_id, &files)
            .await
        {
            Ok(()) => {
                self.ctx.bus.log(
                    EventType::LocalIndexUpdated,
                    json!({"folder": self.cfg.id, "items": files.len()}),
                );
                if let Some(file) = last_file {
                    // Let peers know something new landed.
                    let _ = self.ctx.received_tx.send((self.cfg.id.clone(), file));
                }
            }
            Err(err) => {
                tracing::warn!(folder = %self.cfg.id, "db update failed: {err}");
            }
        }
        batch.clear();
    }
}
