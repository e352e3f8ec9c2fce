//! Knowledge tools: let the agent persist and recall per-guest notes

use futures::FutureExt;
use pulse_core::Result;
use pulse_store::NoteCategory;
use serde_json::{json, Value};

use crate::executor::ToolExecutor;
use crate::registry::ToolRegistry;
use crate::tool::{str_arg, FnTool, ToolResult};

const KNOWLEDGE_UNAVAILABLE: &str = "Knowledge storage not available.";

pub(super) fn register(registry: &mut ToolRegistry) {
    let categories: Vec<&str> = NoteCategory::ORDER.iter().map(|c| c.as_str()).collect();

    registry.register(FnTool::new(
        "pulse_save_note",
        "Save a note about a guest for future sessions: credentials location, services, important paths, configuration or learnings. Saving a note with an existing category and title replaces its content.",
        json!({
            "type": "object",
            "properties": {
                "guest_id": {"type": "string", "description": "Resource ID the note belongs to"},
                "guest_name": {"type": "string", "description": "Display name of the resource"},
                "guest_type": {"type": "string", "description": "vm, container, node or host"},
                "category": {"type": "string", "enum": categories},
                "title": {"type": "string", "description": "Short title, unique within the category"},
                "content": {"type": "string", "description": "The note text"}
            },
            "required": ["guest_id", "category", "title", "content"]
        }),
        |e, args| e.save_note(args).boxed(),
    ));

    registry.register(FnTool::new(
        "pulse_get_notes",
        "Recall notes saved about a guest, optionally limited to one category.",
        json!({
            "type": "object",
            "properties": {
                "guest_id": {"type": "string", "description": "Resource ID to recall notes for"},
                "category": {"type": "string", "enum": categories}
            },
            "required": ["guest_id"]
        }),
        |e, args| e.get_notes(args).boxed(),
    ));
}

impl ToolExecutor {
    async fn save_note(&self, args: Value) -> Result<ToolResult> {
        let guest_id = str_arg(&args, "guest_id");
        let title = str_arg(&args, "title");
        let content = str_arg(&args, "content");
        for (field, value) in [("guest_id", guest_id), ("title", title), ("content", content)] {
            if value.is_empty() {
                return Ok(ToolResult::error(format!("{} is required", field)));
            }
        }
        let category: NoteCategory = match str_arg(&args, "category").parse() {
            Ok(c) => c,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };
        let Some(store) = self.providers().await.knowledge else {
            return Ok(ToolResult::text(KNOWLEDGE_UNAVAILABLE));
        };

        if let Err(e) = store
            .save_note(
                guest_id,
                str_arg(&args, "guest_name"),
                str_arg(&args, "guest_type"),
                category,
                title,
                content,
            )
            .await
        {
            return Ok(ToolResult::error(format!("failed to save note: {}", e)));
        }

        ToolResult::json(&json!({
            "success": true,
            "guest_id": guest_id,
            "category": category,
            "title": title,
            "message": "Note saved successfully",
        }))
    }

    async fn get_notes(&self, args: Value) -> Result<ToolResult> {
        let guest_id = str_arg(&args, "guest_id");
        if guest_id.is_empty() {
            return Ok(ToolResult::error("guest_id is required"));
        }
        let category = match str_arg(&args, "category") {
            "" => None,
            raw => match raw.parse::<NoteCategory>() {
                Ok(c) => Some(c),
                Err(e) => return Ok(ToolResult::error(e.to_string())),
            },
        };
        let Some(store) = self.providers().await.knowledge else {
            return Ok(ToolResult::text(KNOWLEDGE_UNAVAILABLE));
        };

        let knowledge = match store.get(guest_id).await {
            Ok(k) => k,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };
        let notes: Vec<_> = knowledge
            .notes
            .into_iter()
            .filter(|n| category.map_or(true, |c| n.category == c))
            .collect();

        ToolResult::json(&json!({
            "guest_id": guest_id,
            "guest_name": knowledge.guest_name,
            "notes": notes,
            "count": notes.len(),
        }))
    }
}
