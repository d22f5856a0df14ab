#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg_key: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "prompt",
        action: "set_prompt",
        arg_key: "prompt",
    },
    CommandSpec {
        command: "model",
        action: "set_model",
        arg_key: "model",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "image",
        action: "select_image",
        arg_key: "path",
    },
    CommandSpec {
        command: "use",
        action: "select_image",
        arg_key: "path",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "remove",
        action: "remove_image",
        arg_key: "",
    },
    CommandSpec {
        command: "analyze",
        action: "analyze",
        arg_key: "",
    },
    CommandSpec {
        command: "status",
        action: "status",
        arg_key: "",
    },
    CommandSpec {
        command: "wait",
        action: "wait",
        arg_key: "",
    },
    CommandSpec {
        command: "help",
        action: "help",
        arg_key: "",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
        arg_key: "",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
        arg_key: "",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/image",
    "/remove",
    "/prompt",
    "/analyze",
    "/status",
    "/wait",
    "/model",
    "/help",
    "/quit",
];
