//! Turning a key into the lines of its branch
//!
//! The path is replayed left to right over a list of slots. Letters append a
//! slot, commands edit an existing one; every slot that needs text is looked
//! up in the store first and generated through the scheduler otherwise.

use crate::error::{LoomError, LoomResult};
use crate::prompt::next_line_request;
use crate::scheduler::{Job, Priority, Scheduler};
use crate::types::{Line, Scene, SceneView};
use loom_keys::{compress_display, BranchKey, KeyError, KeyOp};

/// Model name recorded for lines stored after the end of a scene
pub const EMPTY_MODEL: &str = "(empty)";

/// One position of the branch being rebuilt
#[derive(Debug, Clone, Default)]
struct Slot {
    text: String,
    translated: Option<String>,
    forbidden: Vec<String>,
}

impl Slot {
    fn pending(forbidden: Vec<String>) -> Self {
        Self {
            forbidden,
            ..Self::default()
        }
    }

    fn fill(&mut self, line: Line) {
        self.text = line.text;
        self.translated = line.translated_text;
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl Scheduler {
    /// Resolve a key into its scene view, generating missing lines
    ///
    /// Speculative resolves run on the background queue and leave no trace
    /// in the access log.
    ///
    /// # Errors
    /// - `LoomError::SceneNotFound` if the scene does not exist
    /// - `LoomError::InvalidKey` if the path is malformed or names a human
    ///   line that was never stored
    /// - `LoomError::GenerationFailed` / `LoomError::ShuttingDown` from generation
    pub async fn resolve(&self, key: &BranchKey, username: &str, speculative: bool) -> LoomResult<SceneView> {
        tracing::info!(
            "{} {}",
            if speculative { "Pregenerating" } else { "Resolving" },
            key.display()
        );

        let scene_id = key.scene_id().to_string();
        let scene = self
            .with_store(move |store| store.scene(&scene_id))
            .await?
            .ok_or_else(|| LoomError::SceneNotFound(key.scene_id().to_string()))?;
        let scene = self.translate_scene(scene).await?;
        let priority = if speculative {
            Priority::Background
        } else {
            Priority::Foreground
        };

        let mut slots: Vec<Slot> = Vec::new();
        let mut current = BranchKey::root(key.scene_id());

        for op in key.ops()? {
            current = current.child(op);
            let position = match op {
                KeyOp::Cut(n) => {
                    match slots.get_mut(n) {
                        Some(slot) if !slot.is_empty() => {
                            let text = std::mem::take(&mut slot.text);
                            slot.forbidden.push(text);
                            slot.translated = None;
                        }
                        _ => tracing::debug!("Ignoring cut of empty or missing line {}", n),
                    }
                    continue;
                }
                KeyOp::Insert(n) => {
                    let n = n.min(slots.len());
                    let mut forbidden = Vec::new();
                    if n > 0 && slots[n - 1].is_empty() {
                        forbidden.extend(slots[n - 1].forbidden.iter().cloned());
                    }
                    if let Some(displaced) = slots.get(n).filter(|s| s.is_empty()) {
                        forbidden.extend(displaced.forbidden.iter().cloned());
                    }
                    slots.insert(n, Slot::pending(forbidden));
                    n
                }
                KeyOp::Regenerate(n) => {
                    let Some(slot) = slots.get_mut(n) else {
                        tracing::debug!("Ignoring regeneration of missing line {}", n);
                        continue;
                    };
                    let text = std::mem::take(&mut slot.text);
                    if !text.is_empty() {
                        slot.forbidden.push(text);
                    }
                    slot.translated = None;
                    n
                }
                KeyOp::Continue(letter) => {
                    let forbidden = self.previous_variants(&current, letter).await?;
                    slots.push(Slot::pending(forbidden));
                    slots.len() - 1
                }
            };

            let full_key = current.to_string();
            let lookup = full_key.clone();
            let line = match self.with_store(move |store| store.line(&lookup)).await? {
                Some(line) => self.translate_line(line).await?,
                None if op.is_human() => {
                    return Err(KeyError::Malformed {
                        key: full_key,
                        reason: "no human input stored at this key".to_string(),
                    }
                    .into());
                }
                None => {
                    self.generate_slot(&scene, &slots, position, full_key, priority)
                        .await?
                }
            };
            slots[position].fill(line);
        }

        let rating = if speculative {
            None
        } else {
            let (access_key, username) = (key.to_string(), username.to_string());
            self.with_store(move |store| store.log_access(&access_key, &username))
                .await?
        };

        let translated_lines = self
            .translator()
            .map(|_| slots.iter().map(|s| s.translated.clone().unwrap_or_default()).collect());
        Ok(SceneView {
            key: key.to_string(),
            prompt: scene.prompt,
            lines: slots.into_iter().map(|s| s.text).collect(),
            outline: scene.outline,
            rating,
            translated_prompt: scene.translated_prompt,
            translated_lines,
            translated_outline: scene.translated_outline,
        })
    }

    /// Stored texts of the earlier sibling variants `a`..`letter`
    async fn previous_variants(&self, key: &BranchKey, letter: char) -> LoomResult<Vec<String>> {
        if !letter.is_ascii_lowercase() || letter == 'a' {
            return Ok(Vec::new());
        }
        let mut parent = key.to_string();
        parent.pop();

        let forbidden = self
            .with_store(move |store| {
                let mut forbidden = Vec::new();
                for sibling in 'a'..letter {
                    if let Some(line) = store.line(&format!("{parent}{sibling}"))? {
                        forbidden.push(line.text.trim().to_string());
                    }
                }
                Ok(forbidden)
            })
            .await?;
        Ok(forbidden)
    }

    /// Generate the line at `position`, plus follow-ups when it is the last
    /// slot of the branch
    async fn generate_slot(
        &self,
        scene: &Scene,
        slots: &[Slot],
        position: usize,
        key: String,
        priority: Priority,
    ) -> LoomResult<Line> {
        let before: Vec<String> = slots[..position].iter().map(|s| s.text.clone()).collect();
        let forbidden = slots[position].forbidden.clone();

        let Some((request, prepend)) = next_line_request(scene, &before, key.clone(), forbidden, self.config())
        else {
            tracing::info!("Scene ended before {}, storing an empty line", compress_display(&key));
            return self.store_direct(Line::new(key, "", EMPTY_MODEL)).await;
        };

        // `key+a` appends after the last slot, so only the last slot can
        // continue along it
        let follow_ups = if position + 1 == slots.len() {
            self.config().alternatives.saturating_sub(1)
        } else {
            0
        };
        let job = Job::new(request, prepend).with_follow_ups(scene.clone(), before, follow_ups);
        self.request_generation(job, priority).await
    }

    async fn translate_scene(&self, mut scene: Scene) -> LoomResult<Scene> {
        let Some(translator) = self.translator() else {
            return Ok(scene);
        };
        let missing_prompt = scene.translated_prompt.is_none();
        let missing_outline = scene.outline.is_some() && scene.translated_outline.is_none();
        if !missing_prompt && !missing_outline {
            return Ok(scene);
        }

        if missing_prompt {
            match translator.translate(&scene.prompt).await {
                Ok(text) => scene.translated_prompt = Some(text),
                Err(e) => tracing::warn!("Translating scene {} failed: {}", scene.key, e),
            }
        }
        if missing_outline {
            if let Some(outline) = &scene.outline {
                match translator.translate(outline).await {
                    Ok(text) => scene.translated_outline = Some(text),
                    Err(e) => tracing::warn!("Translating outline of {} failed: {}", scene.key, e),
                }
            }
        }
        if let Some(prompt) = scene.translated_prompt.clone() {
            let (key, outline) = (scene.key.clone(), scene.translated_outline.clone());
            self.with_store(move |store| store.set_scene_translation(&key, &prompt, outline.as_deref()))
                .await?;
        }
        Ok(scene)
    }

    async fn translate_line(&self, mut line: Line) -> LoomResult<Line> {
        let Some(translator) = self.translator() else {
            return Ok(line);
        };
        if line.translated_text.is_some() {
            return Ok(line);
        }
        match translator.translate(&line.text).await {
            Ok(text) => {
                let (key, translated) = (line.key.clone(), text.clone());
                self.with_store(move |store| store.set_line_translation(&key, &translated))
                    .await?;
                line.translated_text = Some(text);
            }
            Err(e) => tracing::warn!("Translating {} failed: {}", compress_display(&line.key), e),
        }
        Ok(line)
    }
}
