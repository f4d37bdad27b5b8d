pub mod pawns;
