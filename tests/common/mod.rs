//! Shared fixtures for integration tests: a scripted LM client and
//! on-disk fake skills speaking the subprocess protocol.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use stepwise::models::{ChatMessage, ChatMetadata, ChatOptions, ChatReply, LmClient};

/// LM stub that replays queued replies in order.
///
/// An exhausted queue is an error so tests catch unexpected LM calls.
pub struct ScriptedLm {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedLm {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl LmClient for ScriptedLm {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> anyhow::Result<ChatReply> {
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(content) => Ok(ChatReply { content, metadata: ChatMetadata::default() }),
            None => anyhow::bail!("scripted LM exhausted: unexpected chat call"),
        }
    }
}

/// Write a skill directory whose entry script is the given shell body.
///
/// The script sees the JSON request on stdin; `$0` runs from the skill
/// directory, so fixtures can drop marker files next to the manifest.
pub fn write_skill(base: &Path, dir_name: &str, name: &str, description: &str, script_body: &str) {
    let dir = base.join(dir_name);
    std::fs::create_dir_all(dir.join("scripts")).unwrap();
    std::fs::write(
        dir.join("SKILL.md"),
        format!("---\nname: {name}\ndescription: {description}\n---\n# {name}\n\nFixture skill.\n"),
    )
    .unwrap();
    let script = dir.join("scripts").join("entry_skill.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{script_body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// A calendar-assistant fixture that records the request it received to
/// `last_request.json` and reports success.
pub fn write_calendar_skill(base: &Path) {
    write_skill(
        base,
        "calendar_assistant_skill",
        "calendar-assistant",
        "Calendar management skill for creating events from natural language",
        r#"cat > last_request.json
echo '{"success": true, "detail": "event created"}'"#,
    );
}

/// An idea-generation fixture.
pub fn write_ideagen_skill(base: &Path) {
    write_skill(
        base,
        "ideagen_skill",
        "nvidia-ideagen",
        "Generates creative ideas for a topic",
        r#"cat > last_request.json
echo '{"success": true, "ideas": ["idea one", "idea two"]}'"#,
    );
}

/// Build the decomposition JSON an LM would return for the given
/// `(skill_name, sub_query)` steps.
pub fn decomposition_json(steps: &[(&str, &str)]) -> String {
    let output_steps: Vec<serde_json::Value> = steps
        .iter()
        .enumerate()
        .map(|(i, (skill, sub))| {
            serde_json::json!({
                "step_nr": i + 1,
                "skill_name": skill,
                "rationale": format!("use {skill}"),
                "sub_query": sub,
            })
        })
        .collect();
    serde_json::json!({
        "multi_steps": steps.len() > 1,
        "output_steps": output_steps,
    })
    .to_string()
}
