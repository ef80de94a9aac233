pub mod debug_session_tool;
