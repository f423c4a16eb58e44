use ethers::prelude::abigen;

// Generates the bindings for the `IncentiveLayer` contract.
abigen!(
    IncentiveLayer,
    r"[
        event TaskCreated(uint256 id, uint256 deposit)
        event SolverSelected(uint256 task, address solver)
        event TaskStateChange(uint256 task, uint256 state)
        function getTaskInfo(uint256 taskID) external view returns (address, bytes32, uint8, uint8, bytes32)
        function solutionInfo(uint256 taskID) external view returns (uint256, bytes32, bytes32, bytes32, uint8, uint8, bytes32, address)
        function getDeposit(address account) external view returns (uint256)
        function makeDeposit() external payable returns (uint256)
        function registerForTask(uint256 taskID, bytes32 randomBitsHash) external returns (bool)
        function commitSolution(uint256 taskID, bytes32 solutionHash0, bytes32 solutionHash1) external returns (bool)
        function revealSolution(uint256 taskID, bool solution0Correct, uint256 originalRandomBits) external
    ]"
);

// Generates the bindings for the `FileSystem` contract.
abigen!(
    FileSystem,
    r"[
        function getCode(bytes32 id) external view returns (bytes)
        function getIPFSCode(bytes32 id) external view returns (string)
        function getFiles(bytes32 id) external view returns (bytes32[])
        function getName(bytes32 id) external view returns (string)
        function getHash(bytes32 id) external view returns (string)
    ]"
);

// Generates the bindings for the `Interactive` dispute resolution contract.
abigen!(
    Interactive,
    r"[
        event StartChallenge(address p, address c, bytes32 uniq)
        event Queried(bytes32 id, uint256 low, uint256 high)
        event SelectedPhase(bytes32 id, uint256 low, uint256 phase)
        function getTask(bytes32 id) external view returns (uint256)
        function getIndices(bytes32 id) external view returns (uint256, uint256)
        function getStateAt(bytes32 id, uint256 step) external view returns (bytes32)
        function initialize(bytes32 id, bytes32[10] startRoots, uint256[4] startPointers, uint256 steps, bytes32[10] endRoots, uint256[4] endPointers) external
        function report(bytes32 id, uint256 low, uint256 high, bytes32[] arr) external
        function postPhases(bytes32 id, uint256 low, bytes32[13] arr) external
        function callJudge(bytes32 id, uint256 step, uint256 phase, bytes32[] proof, bytes32[] proof2, bytes32 vmHash, bytes32 op, uint256[4] regs, bytes32[10] roots, uint256[4] pointers) external
        function callCustomJudge(bytes32 id, uint256 step, bytes32 op, uint256[4] regs, bytes32 resultState, uint256 resultSize, bytes32[] proof, bytes32[10] roots, uint256[4] pointers) external
        function gameOver(bytes32 id) external returns (bool)
    ]"
);
