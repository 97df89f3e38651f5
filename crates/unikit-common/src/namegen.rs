//! Two-word machine name generator.
//!
//! Names have the shape `adjective_primate`, drawn uniformly at random.
//! Callers retrying after a collision pass `retry > 0` to get an extra
//! digit of entropy; deduplication against existing machines is the
//! caller's job.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "admiring", "adoring", "affectionate", "agitated", "amazing", "angry", "awesome",
    "beautiful", "blissful", "bold", "boring", "brave", "busy", "charming",
    "clever", "compassionate", "competent", "confident", "cool", "cranky", "crazy",
    "dazzling", "determined", "distracted", "dreamy", "eager", "ecstatic", "elastic",
    "elated", "elegant", "eloquent", "epic", "exciting", "fervent", "festive",
    "flamboyant", "focused", "friendly", "frosty", "funny", "gallant", "gifted",
    "goofy", "gracious", "great", "happy", "hardcore", "heuristic", "hopeful",
    "hungry", "infallible", "inspiring", "intelligent", "interesting", "jolly", "jovial",
    "keen", "kind", "laughing", "loving", "lucid", "magical", "modest",
    "musing", "mystifying", "naughty", "nervous", "nice", "nifty", "nostalgic",
    "objective", "optimistic", "peaceful", "pedantic", "pensive", "practical", "priceless",
    "quirky", "quizzical", "recursing", "relaxed", "reverent", "romantic", "serene",
    "sharp", "silly", "sleepy", "stoic", "strange", "stupefied", "suspicious",
    "sweet", "tender", "thirsty", "trusting", "unruffled", "upbeat", "vibrant",
    "vigilant", "vigorous", "wizardly", "wonderful", "xenodochial", "youthful", "zealous",
];

const PRIMATES: &[&str] = &[
    "allenopithecus", "angwantibo", "avahi", "ayeaye", "baboon", "bamboolemur", "bonobo",
    "bushbaby", "capuchin", "chacma", "chimpanzee", "colobus", "cottontop", "douc",
    "douroucouli", "drill", "dryas", "durrell", "dwarflemur", "galago", "gelada",
    "gibbon", "gorilla", "greybrown", "grivet", "guenon", "guereza", "hamadryas",
    "hanuman", "howler", "indri", "kipunji", "langur", "lemur", "loris",
    "lutung", "macaque", "mandrill", "mangabey", "marmoset", "mona", "mouselemur",
    "muriqui", "nightmonkey", "orangutan", "patas", "pithecia", "potto", "proboscis",
    "propithecus", "rhesus", "saki", "siamang", "sifaka", "slowloris", "snubnosed",
    "spidermonkey", "sportivelemur", "squirrelmonkey", "surili", "talapoin", "tamarin", "tarsier",
    "titi", "tonkean", "uakari", "vervet", "woollylemur", "woollymonkey", "barbary",
    "assam", "bonnet", "booted", "crested", "formosan", "japanese", "liontailed",
    "longtailed", "moor", "pigtailed", "stumptailed", "tibetan", "toque", "agile",
    "blackhanded", "brownheaded", "goldenheaded", "goldenlion", "emperor", "geoffroy", "midas",
    "moustached", "pied", "redhanded", "saddleback", "silvery", "weddell", "whitefooted",
    "whitelipped", "allens", "azaras", "bolivian", "collins", "hershkovitz", "humboldt",
    "nancyma", "spix", "vieira", "coppery", "coimbra", "ornate", "whitefaced",
    "annamese", "blackshanked", "greyshanked", "redshanked", "tonkin", "delacour", "francois",
    "hatinh", "laotian", "obscurus", "silvered", "banded", "maroon", "mitred",
    "phayre", "pileated", "purplefaced", "bornean", "sumatran", "tapanuli", "agilis",
    "albifrons", "apella", "azarae", "beelzebul", "caligatus", "cephus", "diana",
];

/// Generates a random `adjective_primate` machine name.
///
/// When `retry > 0` a single digit is appended so repeated collisions
/// converge quickly.
#[must_use]
pub fn random_name(retry: u32) -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let primate = PRIMATES[rng.gen_range(0..PRIMATES.len())];
    let mut name = format!("{adjective}_{primate}");
    if retry > 0 {
        name.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    name
}
