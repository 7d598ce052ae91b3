// Route modules for the Askbox relay server
pub mod websocket; // Presence and message relay over WebSocket
