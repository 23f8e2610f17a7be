impl RwShared {
    /// Create or adjust a directory. Directories are handled in
    /// enumeration order, so parents exist before their children.
    async fn handle_dir(&self, file: &FileInfo, db_tx: &mpsc::Sender<DbUpdateJob>) {
        self.item_started(&file.name, "dir", "update");
        match self.create_or_update_dir(file) {
            Ok(()) => {
                let _ = db_tx
                    .send(DbUpdateJob {
                        file: file.clone(),
                        kind: DbUpdateKind::HandleDir,
                    })
                    .await;
                self.item_finished(&file.name, "dir", "update", None);
            }
            Err(err) => {
                let message = err.to_string();
                tracing::info!(folder = %self.cfg.id, dir = %file.name, "puller: {message}");
                self.new_error(&file.name, &message);
                self.item_finished(&file.name, "dir", "update", Some(&message));
            }
        }
    }

    fn create_or_update_dir(&self, file: &FileInfo) -> Result<(), PullError> {
        let real = real_path_for(&self.cfg.path, &file.name)?;
        let mode = if self.ignore_permissions(file) {
            0o777
        } else {
            file.mode()
        };

        match std::fs::symlink_metadata(&real) {
            Ok(meta) if !meta.is_dir() || meta.file_type().is_symlink() => {
                // A file or link is being replaced with a directory.
                std::fs::remove_file(&real)?;
                make_dir(&real, mode)?;
            }
            Ok(meta) => {
                // Just correct the mode bits. Modification times on
                // directories are not tracked.
                if !self.ignore_permissions(file) {
                    let retained = meta.permissions().mode() & RETAIN_BITS;
                    std::fs::set_permissions(&real, Permissions::from_mode(mode | retained))?;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // The parent already exists; a plain mkdir with the right
                // mode from the start.
                make_dir(&real, mode)?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Delete a directory, clearing temp files and ignored-but-deletable
    /// entries standing in its way first.
    async fn delete_dir(&self, file: &FileInfo, db_tx: &mpsc::Sender<DbUpdateJob>) {
        self.item_started(&file.name, "dir", "delete");
        match self.remove_dir(file) {
            Ok(()) => {
                let _ = db_tx
                    .send(DbUpdateJob {
                        file: file.clone(),
                        kind: DbUpdateKind::DeleteDir,
                    })
                    .await;
                self.item_finished(&file.name, "dir", "delete", None);
            }
            Err(err) => {
                let message = err.to_string();
                tracing::info!(folder = %self.cfg.id, dir = %file.name, "puller: delete: {message}");
                self.new_error(&file.name, &message);
                self.item_finished(&file.name, "dir", "delete", Some(&message));
            }
        }
    }

    fn remove_dir(&self, file: &FileInfo) -> Result<(), PullError> {
        let real = real_path_for(&self.cfg.path, &file.name)?;

        if let Ok(entries) = std::fs::read_dir(&real) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let rel = format!("{}/{}", file.name, name);
                if is_temporary(&name) || self.matcher.match_name(&rel).is_deletable() {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        match std::fs::remove_dir(&real) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => match std::fs::symlink_metadata(&real) {
                // We can't even stat it and it's not a permission
                // problem: some parent is gone or is no longer a
                // directory. Treat the delete as handled.
                Err(serr) if serr.kind() != io::ErrorKind::PermissionDenied => Ok(()),
                _ => Err(err.into()),
            },
        }
    }

    /// Delete a file, detouring to a conflict copy or the versioner when
    /// the situation calls for it.
    async fn delete_file(&self, file: &FileInfo, db_tx: &mpsc::Sender<DbUpdateJob>) {
        self.item_started(&file.name, "file", "delete");
        let mut working = file.clone();
        match self.remove_file(&mut working).await {
            Ok(()) => {
                let _ = db_tx
                    .send(DbUpdateJob {
                        file: working,
                        kind: DbUpdateKind::DeleteFile,
                    })
                    .await;
                self.item_finished(&file.name, "file", "delete", None);
            }
            Err(err) => {
                let message = err.to_string();
                tracing::info!(folder = %self.cfg.id, file = %file.name, "puller: delete: {message}");
                self.new_error(&file.name, &message);
                self.item_finished(&file.name, "file", "delete", Some(&message));
            }
        }
    }

    async fn remove_file(&self, file: &mut FileInfo) -> Result<(), PullError> {
        let real = real_path_for(&self.cfg.path, &file.name)?;
        let cur = self
            .ctx
            .store
            .current_folder_file(&self.cfg.id, &self.ctx.device_id, &file.name)
            .await?;

        let removal = if let Some(cur) = &cur
            && in_conflict(&cur.version, &file.version, self.ctx.device_id.short_id())
        {
            // A remote delete racing a local edit: keep the local copy as
            // a conflict instead of deleting, and merge the vectors to
            // mark the conflict resolved.
            file.version = file.version.merge(&cur.version);
            move_for_conflict(&real, self.cfg.max_conflicts)
        } else if let Some(versioner) = &self.versioner {
            versioner.archive(&real)
        } else {
            std::fs::remove_file(&real)
        };

        match removal {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => match std::fs::symlink_metadata(&real) {
                Err(serr) if serr.kind() != io::ErrorKind::PermissionDenied => Ok(()),
                _ => Err(err.into()),
            },
        }
    }

    /// Rename shortcut: the pending deletion of `source` and the creation
    /// of `target` have identical content, so a rename satisfies both
    /// without moving a byte.
    async fn rename_file(
        &self,
        source: &FileInfo,
        target: &FileInfo,
        db_tx: &mpsc::Sender<DbUpdateJob>,
    ) {
        self.item_started(&source.name, "file", "delete");
        self.item_started(&target.name, "file", "update");
        tracing::debug!(
            folder = %self.cfg.id,
            "taking rename shortcut {} -> {}",
            source.name,
            target.name
        );

        let err = self.do_rename(source, target, db_tx).await.err();
        let message = err.map(|e| e.to_string());
        self.item_finished(&source.name, "file", "delete", message.as_deref());
        self.item_finished(&target.name, "file", "update", message.as_deref());
    }

    async fn do_rename(
        &self,
        source: &FileInfo,
        target: &FileInfo,
        db_tx: &mpsc::Sender<DbUpdateJob>,
    ) -> Result<(), PullError> {
        let from = real_path_for(&self.cfg.path, &source.name)?;
        let to = real_path_for(&self.cfg.path, &target.name)?;

        let renamed = if let Some(versioner) = &self.versioner {
            // Keep the old name's content in the version store.
            std::fs::copy(&from, &to)
                .map(|_| ())
                .and_then(|_| versioner.archive(&from))
        } else {
            std::fs::rename(&from, &to)
        };

        match renamed {
            Ok(()) => {
                // Both the delete of the source and the creation of the
                // target are handled; fix up metadata and the index.
                let _ = db_tx
                    .send(DbUpdateJob {
                        file: source.clone(),
                        kind: DbUpdateKind::DeleteFile,
                    })
                    .await;

                match self.shortcut_file(target).await {
                    Ok(merged) => {
                        let _ = db_tx
                            .send(DbUpdateJob {
                                file: merged,
                                kind: DbUpdateKind::HandleFile,
                            })
                            .await;
                        Ok(())
                    }
                    Err(err) => {
                        tracing::info!(
                            folder = %self.cfg.id,
                            file = %target.name,
                            "rename from {} metadata: {err}",
                            source.name
                        );
                        self.new_error(&target.name, &err.to_string());
                        Err(err)
                    }
                }
            }
            Err(_) => {
                // The rename failed; delete the source so we make some
                // progress. The target stays unhandled and the next
                // iteration retries it.
                match std::fs::remove_file(&from) {
                    Ok(()) => {
                        let _ = db_tx
                            .send(DbUpdateJob {
                                file: source.clone(),
                                kind: DbUpdateKind::DeleteFile,
                            })
                            .await;
                        Ok(())
                    }
                    Err(err) => {
                        tracing::info!(
                            folder = %self.cfg.id,
                            file = %target.name,
                            "delete {} after failed rename: {err}",
                            source.name
                        );
                        self.new_error(&target.name, &err.to_string());
                        Err(err.into())
                    }
                }
            }
        }
    }

    /// Decide how to satisfy one new or changed file: metadata-only
    /// shortcut, symlink shortcut, or the full fetch pipeline.
    async fn handle_file(
        &self,
        file: FileInfo,
        copy_tx: &mpsc::Sender<CopyBlocksState>,
        db_tx: &mpsc::Sender<DbUpdateJob>,
    ) {
        let folder = &self.cfg.id;
        let cur = match self
            .ctx
            .store
            .current_folder_file(folder, &self.ctx.device_id, &file.name)
            .await
        {
            Ok(cur) => cur,
            Err(err) => {
                self.new_error(&file.name, &err.to_string());
                self.queue.done(&file.name);
                return;
            }
        };

        if let Some(cur_file) = &cur
            && !cur_file.deleted
            && blocks_equal(&cur_file.blocks, &file.blocks)
        {
            // The content is already here in full; only metadata differs.
            tracing::debug!(%folder, item = %file.name, "taking shortcut");
            self.item_started(&file.name, "file", "metadata");
            self.queue.done(&file.name);

            let result = if file.is_symlink() {
                self.shortcut_symlink(&file).map(|()| file.clone())
            } else {
                self.shortcut_file(&file).await
            };
            match result {
                Ok(merged) => {
                    self.item_finished(&file.name, "file", "metadata", None);
                    let _ = db_tx
                        .send(DbUpdateJob {
                            file: merged,
                            kind: DbUpdateKind::ShortcutFile,
                        })
                        .await;
                }
                Err(err) => {
                    let message = err.to_string();
                    tracing::info!("puller: shortcut: {message}");
                    self.new_error(&file.name, &message);
                    self.item_finished(&file.name, "file", "metadata", Some(&message));
                }
            }
            return;
        }

        let (real_name, temp_name) = match (
            real_path_for(&self.cfg.path, &file.name),
            temp_path_for(&self.cfg.path, &file.name),
        ) {
            (Ok(real), Ok(temp)) => (real, temp),
            (Err(err), _) | (_, Err(err)) => {
                self.new_error(&file.name, &err.to_string());
                self.queue.done(&file.name);
                return;
            }
        };

        if let Some(cur_file) = &cur
            && !cur_file.deleted
            && !cur_file.is_directory()
            && !cur_file.is_symlink()
            && let Ok(meta) = std::fs::symlink_metadata(&real_name)
        {
            // Staleness guard: if the file on disk no longer matches the
            // index record there may be local changes we haven't hashed.
            // Don't touch it; scan it in the background and let a later
            // iteration retry.
            let observed = mtime_secs(&meta);
            let mtime = self
                .ctx
                .store
                .mtime_for(folder, &file.name, observed)
                .await
                .unwrap_or(observed);
            if mtime != cur_file.modified || meta.len() != cur_file.size {
                tracing::debug!(
                    "file modified but not rescanned; not pulling: {}",
                    real_name.display()
                );
                self.request_rescan(&file.name);
                return;
            }
        }

        // Check an old temporary for blocks we can keep.
        let (mut fetch, reused_indexes, fetch_size) = match blocks::hash_file(&temp_name) {
            Ok(temp_blocks) => {
                let (need, reused) = block_diff(&temp_blocks, &file.blocks);
                let need_size: u64 = need.iter().map(|b| u64::from(b.size)).sum();
                if reused.is_empty() {
                    // Nothing useful in it; remove it so the exclusive
                    // create in the puller state doesn't trip over it.
                    let _ = osutil::remove_file_if_exists(&temp_name);
                }
                (need, reused, need_size)
            }
            Err(_) => (file.blocks.clone(), Vec::new(), file.size),
        };

        if self.cfg.check_free_space()
            && let Ok(free) = osutil::disk_free_bytes(&self.cfg.path)
            && free < fetch_size
        {
            tracing::warn!(
                %folder,
                "insufficient disk space for {}: have {free} B, need {fetch_size} B",
                file.name
            );
            self.new_error(&file.name, "insufficient space");
            return;
        }

        // Shuffle so that peers are not all asked for the same block at
        // the same time.
        fetch.shuffle(&mut rand::thread_rng());

        self.item_started(&file.name, "file", "update");

        let version = cur.as_ref().map(|c| c.version.clone()).unwrap_or_default();
        let blocks_needed = fetch.len();
        let reused = reused_indexes.len();
        let state = Arc::new(SharedPullerState::new(
            file.clone(),
            folder.clone(),
            temp_name,
            real_name,
            blocks_needed,
            reused,
            reused_indexes,
            version,
            self.ignore_permissions(&file),
            self.cfg.allow_sparse(),
        ));

        tracing::debug!(
            %folder,
            item = %file.name,
            "need file; copy {blocks_needed}, reused {reused}"
        );
        let _ = copy_tx.send(CopyBlocksState { state, blocks: fetch }).await;
    }

    /// Apply mode and mtime when that is all that changed, and merge the
    /// version vector with the local record so our clock never moves
    /// backwards.
    async fn shortcut_file(&self, file: &FileInfo) -> Result<FileInfo, PullError> {
        let real = real_path_for(&self.cfg.path, &file.name)?;
        if !self.ignore_permissions(file) {
            std::fs::set_permissions(&real, Permissions::from_mode(file.mode()))?;
        }

        if osutil::set_mtime(&real, file.modified).is_err() {
            // The filesystem refused; remember the intention instead.
            let meta = std::fs::metadata(&real)?;
            self.ctx
                .store
                .update_mtime(&self.cfg.id, &file.name, mtime_secs(&meta), file.modified)
                .await?;
        }

        let mut merged = file.clone();
        if let Some(cur) = self
            .ctx
            .store
            .current_folder_file(&self.cfg.id, &self.ctx.device_id, &file.name)
            .await?
        {
            merged.version = merged.version.merge(&cur.version);
        }
        Ok(merged)
    }

    /// Symlink metadata shortcut. Link type only matters on platforms
    /// that distinguish file and directory links; here there is nothing
    /// to adjust.
    fn shortcut_symlink(&self, _file: &FileInfo) -> Result<(), PullError> {
        Ok(())
    }

    /// Copier stage: satisfy blocks from local sources where possible,
    /// forward the rest to the network stage.
    async fn copier_routine(
        &self,
        rx: Arc<AsyncMutex<mpsc::Receiver<CopyBlocksState>>>,
        pull_tx: mpsc::Sender<PullBlockState>,
        finisher_tx: mpsc::Sender<Arc<SharedPullerState>>,
    ) {
        while let Some(cs) = recv_shared(&rx).await {
            let state = cs.state;
            let fd = match state.temp_file() {
                Ok(fd) => fd,
                Err(_) => {
                    // Nothing more to do without a temporary.
                    let _ = finisher_tx.send(state).await;
                    continue;
                }
            };

            if let Some(progress) = &self.ctx.progress {
                progress.register(&state);
            }

            let (folders, roots) = self.ctx.folder_snapshot();

            for block in &cs.blocks {
                if state.sparse && state.counts().reused == 0 && block.is_empty() {
                    // An all-zero block with no temp reuse in play: leave
                    // a hole instead of writing or fetching anything. If
                    // we were reusing a temp file and still had this
                    // block to copy, the temp's copy was not zeroes, so
                    // we must not skip it then.
                    state.copied_from_origin();
                    state.copy_done(block);
                    continue;
                }

                let candidates = self
                    .ctx
                    .store
                    .finder_candidates(&folders, &block.hash)
                    .await
                    .unwrap_or_default();

                let mut found = false;
                for location in candidates {
                    let Some(root) = roots.get(&location.folder) else {
                        continue;
                    };
                    let Ok(path) = real_path_for(root, &location.name) else {
                        continue;
                    };

                    let mut buf = vec![0u8; block.size as usize];
                    let read = File::open(&path).and_then(|src| {
                        src.read_exact_at(
                            &mut buf,
                            u64::from(location.index) * BLOCK_SIZE as u64,
                        )
                    });
                    if read.is_err() {
                        continue;
                    }

                    match verify_buffer(&buf, block) {
                        Ok(()) => {
                            if let Err(err) = fd.write_all_at(&buf, block.offset) {
                                state.fail("dst write", err);
                            }
                            if location.folder == state.folder
                                && location.name == state.file.name
                            {
                                state.copied_from_origin();
                            }
                            found = true;
                            break;
                        }
                        Err(VerifyError::HashMismatch { observed }) => {
                            // The source changed under us without a
                            // rescan; repair the finder and move on.
                            tracing::debug!(
                                "finder block mismatch in {}:{}:{}",
                                location.folder,
                                location.name,
                                location.index
                            );
                            if let Err(err) = self
                                .ctx
                                .store
                                .finder_fix(
                                    &location.folder,
                                    &location.name,
                                    location.index,
                                    &block.hash,
                                    &observed,
                                )
                                .await
                            {
                                tracing::warn!("finder fix: {err}");
                            }
                        }
                        Err(err) => {
                            tracing::debug!("finder failed to verify buffer: {err}");
                        }
                    }
                }

                if state.failed().is_some() {
                    break;
                }
                if found {
                    state.copy_done(block);
                } else {
                    state.pull_started();
                    let _ = pull_tx
                        .send(PullBlockState {
                            state: Arc::clone(&state),
                            block: block.clone(),
                        })
                        .await;
                }
            }

            let _ = finisher_tx.send(state).await;
        }
    }

    /// Network stage: fetch one block from the least busy peer that
    /// advertises it, rotating through candidates on failure.
    async fn puller_routine(
        &self,
        rx: Arc<AsyncMutex<mpsc::Receiver<PullBlockState>>>,
        finisher_tx: mpsc::Sender<Arc<SharedPullerState>>,
    ) {
        while let Some(ps) = recv_shared(&rx).await {
            let state = ps.state;
            let block = ps.block;

            if state.failed().is_some() {
                let _ = finisher_tx.send(state).await;
                continue;
            }

            // Get the fd up front; a failure here makes the network
            // request pointless.
            let fd = match state.temp_file() {
                Ok(fd) => fd,
                Err(_) => {
                    let _ = finisher_tx.send(state).await;
                    continue;
                }
            };

            if state.sparse && state.counts().reused == 0 && block.is_empty() {
                // No need to request a block of zeroes.
                state.pull_done(&block);
                let _ = finisher_tx.send(state).await;
                continue;
            }

            let mut last_error: Option<String> = None;
            let mut candidates = self
                .ctx
                .store
                .availability(
                    &state.folder,
                    &state.file.name,
                    &state.file.version,
                    &block,
                    &self.ctx.device_id,
                )
                .await
                .unwrap_or_default();

            loop {
                // Least busy peer first; drop it from the candidate set
                // on failure so the rotation makes progress.
                let Some(selected) = self.ctx.activity.least_busy(&candidates) else {
                    match last_error {
                        Some(err) => state.fail("pull", err),
                        None => state.fail("pull", NO_DEVICE_ERROR),
                    }
                    break;
                };
                candidates.retain(|c| *c != selected);

                self.ctx.activity.using(&selected);
                let response = self
                    .ctx
                    .source
                    .request(
                        &selected.device,
                        &state.folder,
                        &state.file.name,
                        block.offset,
                        block.size,
                        &block.hash,
                        selected.from_temporary,
                    )
                    .await;
                self.ctx.activity.done(&selected);

                let buf = match response {
                    Ok(buf) => buf,
                    Err(err) => {
                        tracing::debug!(
                            folder = %state.folder,
                            item = %state.file.name,
                            offset = block.offset,
                            "request returned error: {err}"
                        );
                        last_error = Some(err.to_string());
                        continue;
                    }
                };

                // The request itself may have raced an update on the
                // peer; a mismatch is no mark against the device.
                if verify_buffer(&buf, &block).is_err() {
                    tracing::debug!(
                        folder = %state.folder,
                        item = %state.file.name,
                        offset = block.offset,
                        "hash mismatch"
                    );
                    last_error = Some(format!("hash mismatch from {}", selected.device));
                    continue;
                }

                match fd.write_all_at(&buf, block.offset) {
                    Err(err) => state.fail("save", err),
                    Ok(()) => state.pull_done(&block),
                }
                break;
            }

            let _ = finisher_tx.send(state).await;
        }
    }

    /// Finisher stage: when all blocks of a state are accounted for,
    /// apply metadata and atomically swap the temp into place.
    async fn finisher_routine(
        &self,
        mut rx: mpsc::Receiver<Arc<SharedPullerState>>,
        db_tx: mpsc::Sender<DbUpdateJob>,
    ) {
        while let Some(state) = rx.recv().await {
            let (closed, mut err) = state.final_close();
            if !closed {
                continue;
            }
            tracing::debug!(folder = %state.folder, item = %state.file.name, "closing");
            self.queue.done(&state.file.name);

            if err.is_none()
                && let Err(finish_err) = self.perform_finish(&state, &db_tx).await
            {
                err = Some(finish_err.to_string());
            }
            if let Some(message) = &err {
                tracing::info!("puller: final: {message}");
                self.new_error(&state.file.name, message);
            }
            self.item_finished(&state.file.name, "file", "update", err.as_deref());

            if let Some(progress) = &self.ctx.progress {
                progress.deregister(&state);
            }
        }
    }

    async fn perform_finish(
        &self,
        state: &Arc<SharedPullerState>,
        db_tx: &mpsc::Sender<DbUpdateJob>,
    ) -> Result<(), PullError> {
        let mut file = state.file.clone();

        if !state.ignore_perms {
            std::fs::set_permissions(&state.temp_name, Permissions::from_mode(file.mode()))?;
        }

        if osutil::set_mtime(&state.temp_name, file.modified).is_err() {
            let meta = std::fs::metadata(&state.temp_name)?;
            self.ctx
                .store
                .update_mtime(&state.folder, &file.name, mtime_secs(&meta), file.modified)
                .await?;
        }

        match std::fs::symlink_metadata(&state.real_name) {
            Ok(meta) if meta.is_dir() => {
                // Directories are not versioned or kept for conflicts,
                // only removed. Fails for non-empty directories, and that
                // error is surfaced.
                std::fs::remove_dir(&state.real_name)?;
            }
            Ok(meta) if meta.file_type().is_symlink() => {
                std::fs::remove_file(&state.real_name)?;
            }
            Ok(_) => {
                if in_conflict(&state.version, &file.version, self.ctx.device_id.short_id()) {
                    // Changed in conflict with the existing file: keep
                    // the loser as a conflict copy and merge the vectors
                    // to mark the conflict resolved.
                    file.version = file.version.merge(&state.version);
                    move_for_conflict(&state.real_name, self.cfg.max_conflicts)?;
                } else if let Some(versioner) = &self.versioner {
                    // Archiving a non-existent file is not an error.
                    versioner.archive(&state.real_name)?;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        // Replace the original content with the new one.
        std::fs::rename(&state.temp_name, &state.real_name)?;

        if file.is_symlink() {
            // The just-renamed file holds the link target text; replace
            // it with an actual symlink.
            let content = std::fs::read(&state.real_name)?;
            std::fs::remove_file(&state.real_name)?;
            let target = String::from_utf8_lossy(&content).into_owned();
            std::os::unix::fs::symlink(target, &state.real_name)?;
        }

        let _ = db_tx
            .send(DbUpdateJob {
                file,
                kind: DbUpdateKind::HandleFile,
            })
            .await;
        Ok(())
    }
}

fn make_dir(path: &std::path::Path, mode: u32) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.mode(mode);
    builder.create(path)
}
