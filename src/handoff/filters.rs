//! Ready-made input filters for handoffs.

use crate::items::RunItem;

use super::HandoffInputData;

/// Drops tool calls, tool outputs and handoff chatter from the history the
/// next agent sees.
pub fn remove_all_tools(data: HandoffInputData) -> HandoffInputData {
    HandoffInputData {
        input_history: data
            .input_history
            .into_iter()
            .filter(|item| !item.is_tool_related())
            .collect(),
        pre_handoff_items: strip_tool_items(data.pre_handoff_items),
        new_items: strip_tool_items(data.new_items),
    }
}

fn strip_tool_items(items: Vec<RunItem>) -> Vec<RunItem> {
    items
        .into_iter()
        .filter(|item| !item.is_tool_related())
        .collect()
}

/// Keeps only the last `n` items of the original input history.
pub fn keep_last_input_items(n: usize) -> impl Fn(HandoffInputData) -> HandoffInputData {
    move |mut data| {
        let len = data.input_history.len();
        data.input_history = data.input_history.split_off(len.saturating_sub(n));
        data
    }
}

#[cfg(test)]
mod tests {
    use crate::items::{ContentPart, InputItem, OutputItem};
    use crate::tools::ToolOutput;

    use super::*;

    #[test]
    fn removes_tool_chatter_everywhere() {
        let data = HandoffInputData {
            input_history: vec![
                InputItem::user("hi"),
                InputItem::function_output("c0", "old"),
            ],
            pre_handoff_items: vec![
                RunItem::ToolCall {
                    agent: "a".to_string(),
                    call: OutputItem::function_call("c1", "lookup", "{}"),
                },
                RunItem::ToolCallOutput {
                    agent: "a".to_string(),
                    call_id: "c1".to_string(),
                    output: ToolOutput::from("x"),
                    raw: InputItem::function_output("c1", "x"),
                },
                RunItem::MessageOutput {
                    agent: "a".to_string(),
                    id: None,
                    content: vec![ContentPart::OutputText {
                        text: "checking".to_string(),
                    }],
                },
            ],
            new_items: vec![RunItem::HandoffOutput {
                source: "a".to_string(),
                target: "b".to_string(),
                call_id: "c2".to_string(),
                output: "{}".to_string(),
            }],
        };

        let filtered = remove_all_tools(data);
        assert_eq!(filtered.input_history, vec![InputItem::user("hi")]);
        assert_eq!(filtered.pre_handoff_items.len(), 1);
        assert!(filtered.new_items.is_empty());
    }

    #[test]
    fn keeps_tail_of_history() {
        let data = HandoffInputData {
            input_history: vec![
                InputItem::user("1"),
                InputItem::user("2"),
                InputItem::user("3"),
            ],
            ..HandoffInputData::default()
        };
        let filtered = keep_last_input_items(2)(data);
        assert_eq!(
            filtered.input_history,
            vec![InputItem::user("2"), InputItem::user("3")]
        );
    }
}
