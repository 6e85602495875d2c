use uuid::Uuid;

const ROOM_ALPHABET: [char; 26] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M',
    'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

/// Eight upper-case letters, easy to read out loud and type on a phone.
/// Uniqueness against live rooms is the caller's job.
pub fn room_code() -> String {
    nanoid::nanoid!(8, &ROOM_ALPHABET)
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
